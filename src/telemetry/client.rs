//! Sampling loop run on a power collector.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::link::{read_frame, TesterLink};
use super::log::MeasurementLog;
use crate::bus::{Signal, SignalSource};
use crate::error::{AppResult, FleetError};

/// Sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    /// Pause between samples
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Read failures tolerated in a row before the loop gives up
    pub max_consecutive_errors: u32,
    /// Pause after a failed read
    #[serde(with = "humantime_serde")]
    pub error_backoff: Duration,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            max_consecutive_errors: 10,
            error_backoff: Duration::from_millis(100),
        }
    }
}

/// Reads frames from a tester into a measurement log until told to stop.
pub struct TelemetryClient {
    settings: SamplingSettings,
}

impl TelemetryClient {
    /// Client sampling with `settings`.
    pub fn new(settings: SamplingSettings) -> Self {
        Self { settings }
    }

    /// Sample until the stop signal arrives on `stop`.
    ///
    /// Returns the number of samples written. Only the stop signal completes
    /// the log. When the link keeps failing or the control bus is lost the
    /// error is returned and the log is left without its completion
    /// trailer; rows already written stay on disk.
    pub async fn run<L, S>(
        &self,
        link: &mut L,
        stop: &mut S,
        mut log: MeasurementLog,
    ) -> AppResult<usize>
    where
        L: TesterLink + ?Sized,
        S: SignalSource + ?Sized,
    {
        let stop_code = Signal::StopPowerCollection.code();
        let mut consecutive_errors = 0;

        loop {
            match read_frame(&mut *link).await {
                Ok(frame) => {
                    consecutive_errors = 0;
                    log.append(Utc::now(), &frame.measurement())?;
                }
                Err(err @ (FleetError::Protocol(_) | FleetError::Connectivity { .. })) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.settings.max_consecutive_errors {
                        warn!(
                            "Giving up after {} consecutive read failures; {} sample(s) kept in '{}'",
                            consecutive_errors,
                            log.rows(),
                            log.path().display()
                        );
                        return Err(err);
                    }
                    debug!("Tester read failed ({}): {}", consecutive_errors, err);
                    sleep(self.settings.error_backoff).await;
                }
                Err(err) => return Err(err),
            }

            match stop.try_recv() {
                Ok(Some(code)) if code == stop_code => break,
                Ok(Some(other)) => debug!("Ignoring bus code {} while sampling", other),
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        "Control bus lost while sampling; {} sample(s) kept in '{}' without completion mark",
                        log.rows(),
                        log.path().display()
                    );
                    return Err(err);
                }
            }
            sleep(self.settings.interval).await;
        }

        let rows = log.rows();
        let path = log.finish()?;
        info!("Sampling stopped: {} sample(s) in '{}'", rows, path.display());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::frame::tests::synthetic_frame;
    use crate::telemetry::link::tests::ScriptedLink;
    use crate::telemetry::log::LogHeader;
    use std::collections::VecDeque;

    struct StopAfter(VecDeque<Option<i32>>);

    impl SignalSource for StopAfter {
        fn try_recv(&mut self) -> AppResult<Option<i32>> {
            Ok(self.0.pop_front().flatten())
        }
    }

    /// Reports the given codes, then fails as a dropped connection would.
    struct LostAfter(VecDeque<Option<i32>>);

    impl SignalSource for LostAfter {
        fn try_recv(&mut self) -> AppResult<Option<i32>> {
            match self.0.pop_front() {
                Some(code) => Ok(code),
                None => Err(FleetError::Protocol("control bus closed".to_string())),
            }
        }
    }

    fn fast() -> SamplingSettings {
        SamplingSettings {
            interval: Duration::from_millis(1),
            max_consecutive_errors: 3,
            error_backoff: Duration::from_millis(1),
        }
    }

    fn open_log(dir: &std::path::Path) -> MeasurementLog {
        let header = LogHeader {
            collector: "pi2".to_string(),
            party: "rpi1".to_string(),
            tester_address: "98:DA:F0:00:4A:13".to_string(),
        };
        MeasurementLog::create(&dir.join("power.csv"), &header).unwrap()
    }

    #[tokio::test]
    async fn stops_cleanly_on_stop_signal() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = ScriptedLink::with_frames(5);
        let mut stop = StopAfter(VecDeque::from(vec![None, Some(101), Some(300)]));

        let client = TelemetryClient::new(fast());
        let rows = client
            .run(&mut link, &mut stop, open_log(dir.path()))
            .await
            .unwrap();

        assert_eq!(rows, 3);
        let path = dir.path().join("power.csv");
        assert!(MeasurementLog::is_complete(&path).unwrap());
        assert_eq!(MeasurementLog::read(&path).unwrap()[2].voltage, 5.002);
    }

    #[tokio::test]
    async fn persistent_link_failure_keeps_partial_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = ScriptedLink::with_frames(2);
        let mut stop = StopAfter(VecDeque::new());

        let client = TelemetryClient::new(fast());
        let err = client
            .run(&mut link, &mut stop, open_log(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Protocol(_)));
        let path = dir.path().join("power.csv");
        assert!(!MeasurementLog::is_complete(&path).unwrap());
        assert_eq!(MeasurementLog::read(&path).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lost_bus_leaves_log_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = ScriptedLink::with_frames(5);
        let mut stop = LostAfter(VecDeque::from(vec![None]));

        let client = TelemetryClient::new(fast());
        let err = client
            .run(&mut link, &mut stop, open_log(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Protocol(_)));
        let path = dir.path().join("power.csv");
        assert!(!MeasurementLog::is_complete(&path).unwrap());
        assert_eq!(MeasurementLog::read(&path).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn isolated_read_failures_are_retried_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut link = ScriptedLink::default();
        let corrupt = |voltage_mv| {
            let mut frame = synthetic_frame(voltage_mv, 1700, 8430);
            frame[129] = 0x00;
            frame
        };
        link.push_frame(synthetic_frame(5000, 1700, 8430));
        link.push_frame(corrupt(5001));
        link.push_frame(synthetic_frame(5002, 1700, 8430));
        link.push_frame(corrupt(5003));
        link.push_frame(synthetic_frame(5004, 1700, 8430));
        let mut stop = StopAfter(VecDeque::from(vec![None, None, None, None, Some(300)]));

        // Two failures in total but never two in a row: the counter starts
        // over after each good frame.
        let settings = SamplingSettings {
            max_consecutive_errors: 2,
            ..fast()
        };
        let rows = TelemetryClient::new(settings)
            .run(&mut link, &mut stop, open_log(dir.path()))
            .await
            .unwrap();

        assert_eq!(rows, 3);
        let path = dir.path().join("power.csv");
        assert!(MeasurementLog::is_complete(&path).unwrap());
        let voltages: Vec<f64> = MeasurementLog::read(&path)
            .unwrap()
            .iter()
            .map(|m| m.voltage)
            .collect();
        assert_eq!(voltages, vec![5.0, 5.002, 5.004]);
    }
}
