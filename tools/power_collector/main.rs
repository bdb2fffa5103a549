//! Power collector: samples a USB power tester until the control bus says stop.
//!
//! Deployed to every collector device and started remotely by the
//! orchestrator. The measurement file only receives its completion trailer
//! when sampling ended on the stop signal.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use energy_fl::bus::BusSubscriber;
use energy_fl::error_recovery::RetryPolicy;
use energy_fl::logging::{self, LogFormat};
use energy_fl::telemetry::link::SerialLink;
use energy_fl::telemetry::{configure, connect, LogHeader, MeasurementLog, SamplingSettings, TelemetryClient};

#[derive(Parser, Debug)]
#[command(name = "power_collector", about = "Sample a USB power tester until told to stop")]
struct Args {
    /// Control bus endpoint (`host:port`).
    #[arg(long)]
    bus: String,
    /// Serial device the tester is bound to.
    #[arg(long, default_value = "/dev/rfcomm0")]
    port: String,
    /// Measurement file to write.
    #[arg(long)]
    output: PathBuf,
    /// Pause between samples.
    #[arg(long, default_value_t = 250)]
    interval_ms: u64,
    /// Read failures tolerated in a row before sampling gives up.
    #[arg(long, default_value_t = 10)]
    max_errors: u32,
    /// Pause after a failed read.
    #[arg(long, default_value_t = 100)]
    error_backoff_ms: u64,
    #[arg(long, default_value_t = 9600)]
    baud_rate: u32,
    /// Longest wait for bytes on one serial read.
    #[arg(long, default_value_t = 1000)]
    read_timeout_ms: u64,
    /// Handshake attempts before giving up on the tester.
    #[arg(long, default_value_t = 10)]
    handshake_attempts: u32,
    /// Pause between handshake attempts.
    #[arg(long, default_value_t = 200)]
    handshake_backoff_ms: u64,
    /// Identity of this collector, recorded in the file header.
    #[arg(long, default_value = "collector")]
    collector: String,
    /// Party being measured, recorded in the file header.
    #[arg(long, default_value = "unknown")]
    party: String,
    /// Tester hardware address, recorded in the file header.
    #[arg(long, default_value = "unknown")]
    tester: String,
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Log as JSON lines.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn sampling(&self) -> SamplingSettings {
        SamplingSettings {
            interval: Duration::from_millis(self.interval_ms),
            max_consecutive_errors: self.max_errors,
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }

    fn handshake(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.handshake_attempts,
            Duration::from_millis(self.handshake_backoff_ms),
        )
    }
}

async fn collect(args: Args) -> Result<usize> {
    let mut bus = BusSubscriber::connect(&args.bus)
        .await
        .with_context(|| format!("subscribing to {}", args.bus))?;
    info!("Subscribed to control bus at {}", args.bus);

    let mut link = SerialLink::open(
        &args.port,
        args.baud_rate,
        Duration::from_millis(args.read_timeout_ms),
    )?;
    let first = connect(&mut link, &args.port, &args.handshake()).await?;
    info!("Tester answered: {:.3} V", first.voltage());
    configure(&mut link).await?;

    let header = LogHeader {
        collector: args.collector.clone(),
        party: args.party.clone(),
        tester_address: args.tester.clone(),
    };
    let log = MeasurementLog::create(&args.output, &header)?;
    let client = TelemetryClient::new(args.sampling());
    Ok(client.run(&mut link, &mut bus, log).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let format = if args.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    logging::init(&args.log_level, format)?;

    let output = args.output.clone();
    match collect(args).await {
        Ok(samples) => {
            info!("Wrote {} sample(s) to {}", samples, output.display());
            Ok(())
        }
        Err(err) => {
            error!("Power collection failed: {:#}", err);
            Err(err)
        }
    }
}
