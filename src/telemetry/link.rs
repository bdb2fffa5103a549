//! Byte link to a power tester.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::frame::{TelemetryFrame, TesterCommand, FRAME_LEN, START_MARKER};
use crate::error::{AppResult, FleetError};
use crate::error_recovery::RetryPolicy;

/// Consecutive empty reads tolerated while assembling one frame.
pub const MAX_EMPTY_READS: u32 = 5;

/// Bytes skipped while looking for a start marker before a dump is abandoned.
pub const MAX_DISCARDED_BYTES: usize = 4 * FRAME_LEN;

const COMMAND_PAUSE: Duration = Duration::from_millis(100);

/// Raw transport to the tester.
#[async_trait]
pub trait TesterLink: Send {
    /// Write one command byte.
    async fn send(&mut self, byte: u8) -> AppResult<()>;

    /// Read whatever is available into `buf`. `Ok(0)` means nothing arrived
    /// within the link's read timeout.
    async fn recv(&mut self, buf: &mut [u8]) -> AppResult<usize>;

    /// Drop input that arrived before the next request. Links without an
    /// input buffer of their own keep this no-op.
    async fn discard_input(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Cut everything before the first start marker. Returns the bytes dropped.
///
/// A trailing first marker byte is kept since its partner may come with the
/// next read.
fn align_to_start(frame: &mut Vec<u8>) -> usize {
    let marker = START_MARKER.to_be_bytes();
    let cut = match frame.windows(2).position(|w| w == marker.as_slice()) {
        Some(at) => at,
        None if frame.last() == Some(&marker[0]) => frame.len() - 1,
        None => frame.len(),
    };
    frame.drain(..cut);
    cut
}

/// Request a dump and assemble exactly one frame.
///
/// Stale input is discarded before the request, and bytes ahead of the start
/// marker are skipped, so a frame cut short by an earlier timeout cannot
/// shift every later one.
pub async fn read_frame<L: TesterLink + ?Sized>(link: &mut L) -> AppResult<TelemetryFrame> {
    link.discard_input().await?;
    link.send(TesterCommand::RequestDump.byte()).await?;

    let mut frame = Vec::with_capacity(FRAME_LEN);
    let mut buf = [0u8; 1024];
    let mut empty_reads = 0;
    let mut discarded = 0;
    while frame.len() < FRAME_LEN {
        let n = link.recv(&mut buf).await?;
        if n == 0 {
            empty_reads += 1;
            if empty_reads >= MAX_EMPTY_READS {
                return Err(FleetError::Protocol(format!(
                    "tester went silent after {} of {} bytes",
                    frame.len(),
                    FRAME_LEN
                )));
            }
            continue;
        }
        empty_reads = 0;
        frame.extend_from_slice(&buf[..n]);
        discarded += align_to_start(&mut frame);
        if discarded > MAX_DISCARDED_BYTES {
            return Err(FleetError::Protocol(format!(
                "no start marker in {} bytes from the tester",
                discarded
            )));
        }
    }
    if discarded > 0 {
        debug!("Skipped {} byte(s) ahead of the frame start", discarded);
    }

    if frame.len() != FRAME_LEN {
        return Err(FleetError::Protocol(format!(
            "tester sent {} bytes for one dump",
            frame.len()
        )));
    }
    TelemetryFrame::decode(&frame)
}

/// Handshake: read frames until one decodes, within `policy`.
pub async fn connect<L: TesterLink + ?Sized>(
    link: &mut L,
    device: &str,
    policy: &RetryPolicy,
) -> AppResult<TelemetryFrame> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match read_frame(&mut *link).await {
            Ok(frame) => {
                debug!("tester on {} answered on attempt {}", device, attempt);
                return Ok(frame);
            }
            Err(err) if attempt < attempts => {
                warn!(
                    "tester handshake on {} failed (attempt {}/{}): {}",
                    device, attempt, attempts, err
                );
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(FleetError::connectivity(device.to_string(), err.to_string()));
            }
        }
    }
}

/// Put the tester in the state sampling expects: data group 5, screensaver
/// off, screen dimmed, group cleared.
pub async fn configure<L: TesterLink + ?Sized>(link: &mut L) -> AppResult<()> {
    let sequence = [
        TesterCommand::SetDataGroupFive,
        TesterCommand::SetScreensaver,
        TesterCommand::DimScreen,
        TesterCommand::ClearDataGroup,
    ];
    for (i, command) in sequence.iter().enumerate() {
        if i > 0 {
            sleep(COMMAND_PAUSE).await;
        }
        link.send(command.byte()).await?;
    }
    Ok(())
}

#[cfg(feature = "instrument_serial")]
pub use serial::SerialLink;

#[cfg(feature = "instrument_serial")]
mod serial {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

    use super::TesterLink;
    use crate::error::{AppResult, FleetError};

    /// Tester bound to a serial device (e.g. an RFCOMM port).
    pub struct SerialLink {
        port: SerialStream,
        path: String,
        read_timeout: Duration,
    }

    impl SerialLink {
        /// Open `path` at 8N1 without flow control.
        pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> AppResult<Self> {
            let port = tokio_serial::new(path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| FleetError::connectivity(path.to_string(), e.to_string()))?;
            Ok(Self {
                port,
                path: path.to_string(),
                read_timeout,
            })
        }
    }

    #[async_trait]
    impl TesterLink for SerialLink {
        async fn send(&mut self, byte: u8) -> AppResult<()> {
            self.port
                .write_all(&[byte])
                .await
                .map_err(|e| FleetError::connectivity(self.path.clone(), e.to_string()))
        }

        async fn recv(&mut self, buf: &mut [u8]) -> AppResult<usize> {
            match tokio::time::timeout(self.read_timeout, self.port.read(buf)).await {
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(FleetError::connectivity(self.path.clone(), e.to_string())),
                Err(_) => Ok(0),
            }
        }

        async fn discard_input(&mut self) -> AppResult<()> {
            SerialPort::clear(&self.port, ClearBuffer::Input)
                .map_err(|e| FleetError::connectivity(self.path.clone(), e.to_string()))
        }
    }
}
