//! Collector sampling loop against a simulated tester and a real TCP bus.

use std::time::Duration;

use async_trait::async_trait;
use energy_fl::bus::{BusPublisher, BusSubscriber, Signal};
use energy_fl::error_recovery::RetryPolicy;
use energy_fl::telemetry::{
    configure, connect, LogHeader, MeasurementLog, SamplingSettings, TelemetryClient, TesterLink,
    FRAME_LEN,
};
use energy_fl::AppResult;
use tokio_test::assert_ok;

/// Tester answering every dump request with one frame, optionally after
/// staying silent for the first few requests.
struct SimulatedTester {
    sent: Vec<u8>,
    silent_dumps: u32,
    pending: Vec<u8>,
    samples: u16,
}

impl SimulatedTester {
    fn new(silent_dumps: u32) -> Self {
        Self {
            sent: Vec::new(),
            silent_dumps,
            pending: Vec::new(),
            samples: 0,
        }
    }

    fn frame(voltage_mv: u16) -> Vec<u8> {
        let mut frame = vec![0u8; FRAME_LEN];
        frame[0..2].copy_from_slice(&0x0963u16.to_be_bytes());
        frame[2..4].copy_from_slice(&voltage_mv.to_be_bytes());
        frame[4..6].copy_from_slice(&1700u16.to_be_bytes());
        frame[6..10].copy_from_slice(&8430u32.to_be_bytes());
        frame[128..130].copy_from_slice(&0xFFF1u16.to_be_bytes());
        frame
    }
}

#[async_trait]
impl TesterLink for SimulatedTester {
    async fn send(&mut self, byte: u8) -> AppResult<()> {
        self.sent.push(byte);
        if byte == 0xF0 {
            if self.silent_dumps > 0 {
                self.silent_dumps -= 1;
            } else {
                self.pending = Self::frame(5000 + self.samples);
                self.samples += 1;
            }
        }
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

fn header() -> LogHeader {
    LogHeader {
        collector: "pi2".to_string(),
        party: "rpi1".to_string(),
        tester_address: "98:DA:F0:00:4A:13".to_string(),
    }
}

fn fast_sampling() -> SamplingSettings {
    SamplingSettings {
        interval: Duration::from_millis(5),
        max_consecutive_errors: 3,
        error_backoff: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn handshake_survives_a_silent_tester() {
    let mut tester = SimulatedTester::new(2);
    let policy = RetryPolicy::new(5, Duration::from_millis(1));
    let frame = assert_ok!(connect(&mut tester, "/dev/rfcomm0", &policy).await);
    assert_eq!(frame.voltage(), 5.0);

    assert_ok!(configure(&mut tester).await);
    assert_eq!(&tester.sent[tester.sent.len() - 4..], &[0xA5, 0xE1, 0xD0, 0xF4]);
}

#[tokio::test]
async fn handshake_gives_up_after_policy() {
    let mut tester = SimulatedTester::new(10);
    let policy = RetryPolicy::new(3, Duration::from_millis(1));
    assert!(connect(&mut tester, "/dev/rfcomm0", &policy).await.is_err());
}

#[tokio::test]
async fn stop_signal_over_the_bus_completes_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Outputs/Power/run_rpi1.csv");

    let publisher = BusPublisher::bind("127.0.0.1:0").await.unwrap();
    let mut subscriber = BusSubscriber::connect(&publisher.local_addr().to_string())
        .await
        .unwrap();
    assert_ok!(
        publisher
            .wait_for_subscribers(1, Duration::from_secs(2))
            .await
    );

    let log = MeasurementLog::create(&path, &header()).unwrap();
    let sampling = tokio::spawn(async move {
        let mut tester = SimulatedTester::new(0);
        TelemetryClient::new(fast_sampling())
            .run(&mut tester, &mut subscriber, log)
            .await
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(publisher.publish_signal(Signal::StopPowerCollection).await, 1);

    let rows = sampling.await.unwrap().unwrap();
    assert!(rows >= 1);
    assert!(MeasurementLog::is_complete(&path).unwrap());

    let samples = MeasurementLog::read(&path).unwrap();
    assert_eq!(samples.len(), rows);
    assert_eq!(samples[0].voltage, 5.0);
    assert_eq!(samples[0].current, 0.17);
    publisher.shutdown().await;
}

#[tokio::test]
async fn closed_bus_ends_sampling_without_completion_mark() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("power.csv");

    let publisher = BusPublisher::bind("127.0.0.1:0").await.unwrap();
    let mut subscriber = BusSubscriber::connect(&publisher.local_addr().to_string())
        .await
        .unwrap();
    publisher
        .wait_for_subscribers(1, Duration::from_secs(2))
        .await
        .unwrap();

    let log = MeasurementLog::create(&path, &header()).unwrap();
    let sampling = tokio::spawn(async move {
        let mut tester = SimulatedTester::new(0);
        TelemetryClient::new(fast_sampling())
            .run(&mut tester, &mut subscriber, log)
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    publisher.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(2), sampling).await;
    assert!(result.unwrap().unwrap().is_err());
    assert!(!MeasurementLog::is_complete(&path).unwrap());
    assert!(!MeasurementLog::read(&path).unwrap().is_empty());
}
