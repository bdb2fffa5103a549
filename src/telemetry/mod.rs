//! Power telemetry from USB testers.
//!
//! Runs on the power collectors, not on the orchestrator host:
//!
//! - [`frame`]: the 130-byte dump frame and the tester's command bytes
//! - [`link`]: byte transport, frame assembly, handshake and setup
//! - [`log`]: the measurement file and its completion trailer
//! - [`client`]: the sampling loop, stopped through the control bus

pub mod client;
pub mod frame;
pub mod link;
pub mod log;

pub use client::{SamplingSettings, TelemetryClient};
pub use frame::{Measurement, TelemetryFrame, TesterCommand, FRAME_LEN};
pub use link::{configure, connect, read_frame, TesterLink};
pub use log::{LogHeader, MeasurementLog, Sample, COMPLETE_TRAILER};
