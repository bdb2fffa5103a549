//! On-collector measurement file.
//!
//! A CSV file preceded by `# ` comment lines describing the recording. One
//! row is written and flushed per sample so a crashed collector still leaves
//! usable partial data. A clean stop appends [`COMPLETE_TRAILER`]; its
//! absence is how the orchestrator recognises an interrupted recording.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::frame::Measurement;
use crate::error::AppResult;

/// Last line of a log whose sampling ended on the stop signal.
pub const COMPLETE_TRAILER: &str = "# status=complete";

const COLUMNS: [&str; 6] = ["timestamp", "voltage", "current", "power", "mah", "mwh"];

/// Who recorded the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    /// Collector identity
    pub collector: String,
    /// Party measured
    pub party: String,
    /// Tester hardware address
    pub tester_address: String,
}

/// One recorded row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// RFC 3339, milliseconds
    pub timestamp: String,
    /// V
    pub voltage: f64,
    /// A
    pub current: f64,
    /// W
    pub power: f64,
    /// mAh
    pub mah: u32,
    /// mWh
    pub mwh: u32,
}

/// Measurement file being written by a collector.
pub struct MeasurementLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl MeasurementLog {
    /// Create `path` with its comment header and column row.
    pub fn create(path: &Path, header: &LogHeader) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        writeln!(file, "# collector={}", header.collector)?;
        writeln!(file, "# party={}", header.party)?;
        writeln!(file, "# tester={}", header.tester_address)?;
        writeln!(
            file,
            "# started={}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        )?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(COLUMNS)?;
        writer.flush()?;
        info!("Measurement log opened at '{}'", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Samples written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Append and flush one sample.
    pub fn append(&mut self, at: DateTime<Utc>, measurement: &Measurement) -> AppResult<()> {
        self.writer.write_record(&[
            at.to_rfc3339_opts(SecondsFormat::Millis, true),
            measurement.voltage.to_string(),
            measurement.current.to_string(),
            measurement.power.to_string(),
            measurement.mah.to_string(),
            measurement.mwh.to_string(),
        ])?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Flush, mark the recording complete and close the file.
    pub fn finish(mut self) -> AppResult<PathBuf> {
        self.writer.flush()?;
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        writeln!(file, "{}", COMPLETE_TRAILER)?;
        file.sync_all()?;
        info!(
            "Measurement log '{}' closed with {} sample(s)",
            self.path.display(),
            self.rows
        );
        Ok(self.path)
    }

    /// Whether the file at `path` ends with the completion trailer.
    pub fn is_complete(path: &Path) -> AppResult<bool> {
        let reader = BufReader::new(File::open(path)?);
        let mut last = String::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last = line;
            }
        }
        Ok(last.trim() == COMPLETE_TRAILER)
    }

    /// Read back every sample, skipping comment lines.
    pub fn read(path: &Path) -> AppResult<Vec<Sample>> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_path(path)?;
        let samples = reader.deserialize().collect::<Result<Vec<Sample>, _>>()?;
        Ok(samples)
    }
}
