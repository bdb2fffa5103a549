//! USB power tester wire format.
//!
//! Every request-dump command is answered by exactly one 130-byte frame.
//! All fields are big-endian and unsigned at fixed offsets.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, FleetError};

/// Bytes in one frame.
pub const FRAME_LEN: usize = 130;
/// First two bytes of every frame.
pub const START_MARKER: u16 = 0x0963;
/// Last two bytes of every frame.
pub const STOP_MARKER: u16 = 0xFFF1;
/// Data groups reported per frame.
pub const DATA_GROUPS: usize = 10;

/// Single-byte tester commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TesterCommand {
    /// Answer with one frame
    RequestDump = 0xF0,
    /// Reset the selected data group
    ClearDataGroup = 0xF4,
    /// Select data group 5
    SetDataGroupFive = 0xA5,
    /// Lowest backlight
    DimScreen = 0xD0,
    /// Screensaver off
    SetScreensaver = 0xE1,
}

impl TesterCommand {
    /// Byte sent on the wire.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Accumulated charge and energy of one data group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGroup {
    /// mAh
    pub mah: u32,
    /// mWh
    pub mwh: u32,
}

/// One decoded frame with raw field values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// mV
    pub voltage_mv: u16,
    /// 0.1 mA units
    pub current_raw: u16,
    /// mW
    pub power_mw: u32,
    /// °C
    pub temp_celsius: u16,
    /// °F
    pub temp_fahrenheit: u16,
    /// Index of the active data group
    pub selected_group: u8,
    /// Totals of every data group
    pub groups: [DataGroup; DATA_GROUPS],
    /// centivolts
    pub data_plus_cv: u16,
    /// centivolts
    pub data_minus_cv: u16,
    /// Charging mode reported by the tester
    pub charging_mode: u8,
    /// mAh recorded above the current threshold
    pub threshold_mah: u32,
    /// mWh recorded above the current threshold
    pub threshold_mwh: u32,
    /// Recording threshold as reported by the tester
    pub threshold_setting: u16,
    /// seconds
    pub recording_duration: u32,
    /// Threshold recording running
    pub recording_active: bool,
    /// Screen timeout setting
    pub screen_timeout: u16,
    /// Backlight level
    pub backlight: u16,
    /// 0.1 ohm units
    pub resistance_raw: u32,
    /// Screen shown on the tester
    pub current_screen: u8,
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

impl TelemetryFrame {
    /// Decode a complete frame. Anything but exactly [`FRAME_LEN`] bytes with
    /// both markers in place is a protocol error.
    pub fn decode(buf: &[u8]) -> AppResult<Self> {
        if buf.len() != FRAME_LEN {
            return Err(FleetError::Protocol(format!(
                "frame is {} bytes, expected {}",
                buf.len(),
                FRAME_LEN
            )));
        }
        let start = u16_at(buf, 0);
        if start != START_MARKER {
            return Err(FleetError::Protocol(format!(
                "bad start marker {:#06x}",
                start
            )));
        }
        let stop = u16_at(buf, 128);
        if stop != STOP_MARKER {
            return Err(FleetError::Protocol(format!("bad stop marker {:#06x}", stop)));
        }

        let mut groups = [DataGroup::default(); DATA_GROUPS];
        for (i, group) in groups.iter_mut().enumerate() {
            let offset = 16 + i * 8;
            *group = DataGroup {
                mah: u32_at(buf, offset),
                mwh: u32_at(buf, offset + 4),
            };
        }

        Ok(Self {
            voltage_mv: u16_at(buf, 2),
            current_raw: u16_at(buf, 4),
            power_mw: u32_at(buf, 6),
            temp_celsius: u16_at(buf, 10),
            temp_fahrenheit: u16_at(buf, 12),
            selected_group: buf[15],
            groups,
            data_plus_cv: u16_at(buf, 96),
            data_minus_cv: u16_at(buf, 98),
            charging_mode: buf[100],
            threshold_mah: u32_at(buf, 102),
            threshold_mwh: u32_at(buf, 106),
            threshold_setting: u16_at(buf, 110),
            recording_duration: u32_at(buf, 112),
            recording_active: buf[116] == 1,
            screen_timeout: u16_at(buf, 118),
            backlight: u16_at(buf, 120),
            resistance_raw: u32_at(buf, 122),
            current_screen: buf[127],
        })
    }

    /// Volts.
    pub fn voltage(&self) -> f64 {
        f64::from(self.voltage_mv) / 1000.0
    }

    /// Amperes.
    pub fn current(&self) -> f64 {
        f64::from(self.current_raw) / 10.0 / 1000.0
    }

    /// Watts.
    pub fn power(&self) -> f64 {
        f64::from(self.power_mw) / 1000.0
    }

    /// D+ line, volts.
    pub fn data_plus_voltage(&self) -> f64 {
        f64::from(self.data_plus_cv) / 100.0
    }

    /// D- line, volts.
    pub fn data_minus_voltage(&self) -> f64 {
        f64::from(self.data_minus_cv) / 100.0
    }

    /// Ohms.
    pub fn resistance(&self) -> f64 {
        f64::from(self.resistance_raw) / 10.0
    }

    /// Row written to the measurement log.
    pub fn measurement(&self) -> Measurement {
        Measurement {
            voltage: self.voltage(),
            current: self.current(),
            power: self.power(),
            mah: self.threshold_mah,
            mwh: self.threshold_mwh,
        }
    }
}

/// Scaled values recorded per sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// V
    pub voltage: f64,
    /// A
    pub current: f64,
    /// W
    pub power: f64,
    /// Threshold-recording charge
    pub mah: u32,
    /// Threshold-recording energy
    pub mwh: u32,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Well-formed frame carrying the given voltage, current and power.
    pub(crate) fn synthetic_frame(voltage_mv: u16, current_raw: u16, power_mw: u32) -> Vec<u8> {
        let mut buf = vec![0u8; FRAME_LEN];
        buf[0..2].copy_from_slice(&START_MARKER.to_be_bytes());
        buf[2..4].copy_from_slice(&voltage_mv.to_be_bytes());
        buf[4..6].copy_from_slice(&current_raw.to_be_bytes());
        buf[6..10].copy_from_slice(&power_mw.to_be_bytes());
        buf[128..130].copy_from_slice(&STOP_MARKER.to_be_bytes());
        buf
    }

    #[test]
    fn decodes_scaled_readings() {
        let frame = TelemetryFrame::decode(&synthetic_frame(5000, 1700, 8430)).unwrap();
        assert_eq!(frame.voltage(), 5.0);
        assert!((frame.current() - 0.17).abs() < 1e-12);
        assert_eq!(frame.power(), 8.43);

        let frame = TelemetryFrame::decode(&synthetic_frame(5000, 17000, 8430)).unwrap();
        assert!((frame.current() - 1.7).abs() < 1e-12);
    }

    #[test]
    fn decodes_groups_and_threshold_fields() {
        let mut buf = synthetic_frame(5100, 0, 0);
        buf[15] = 5;
        buf[16 + 5 * 8..16 + 5 * 8 + 4].copy_from_slice(&120u32.to_be_bytes());
        buf[16 + 5 * 8 + 4..16 + 5 * 8 + 8].copy_from_slice(&610u32.to_be_bytes());
        buf[96..98].copy_from_slice(&62u16.to_be_bytes());
        buf[102..106].copy_from_slice(&42u32.to_be_bytes());
        buf[106..110].copy_from_slice(&215u32.to_be_bytes());
        buf[116] = 1;
        buf[122..126].copy_from_slice(&297u32.to_be_bytes());

        let frame = TelemetryFrame::decode(&buf).unwrap();
        assert_eq!(frame.selected_group, 5);
        assert_eq!(frame.groups[5], DataGroup { mah: 120, mwh: 610 });
        assert_eq!(frame.data_plus_voltage(), 0.62);
        assert!(frame.recording_active);
        assert!((frame.resistance() - 29.7).abs() < 1e-12);

        let m = frame.measurement();
        assert_eq!((m.mah, m.mwh), (42, 215));
    }

    #[test]
    fn short_frame_is_rejected() {
        let buf = synthetic_frame(5000, 1700, 8430);
        let err = TelemetryFrame::decode(&buf[..129]).unwrap_err();
        assert!(matches!(err, FleetError::Protocol(_)));
    }

    #[test]
    fn wrong_markers_are_rejected() {
        let mut buf = synthetic_frame(5000, 1700, 8430);
        buf[0] = 0x00;
        assert!(TelemetryFrame::decode(&buf).is_err());

        let mut buf = synthetic_frame(5000, 1700, 8430);
        buf[129] = 0x00;
        assert!(TelemetryFrame::decode(&buf).is_err());
    }
}
