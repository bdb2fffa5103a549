//! Pulling run results off the fleet.
//!
//! Party results are merged into the run's local result directory; each
//! collector contributes one measurement file whose completion trailer tells
//! whether sampling ended cleanly.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::experiment::ExperimentDescriptor;
use crate::remote::{probe_token, RemoteExecutor};
use crate::telemetry::MeasurementLog;
use crate::topology::{Party, PowerCollector};

/// Outcome of collecting one party's results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartyArtifacts {
    /// Files merged into the run directory
    Collected {
        /// Files copied
        files: usize,
    },
    /// The party has no result folder for this run
    Missing,
}

/// Outcome of collecting one collector's measurement file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryTransfer {
    /// Transferred and carrying the completion trailer
    Complete(PathBuf),
    /// Transferred, but sampling did not end cleanly
    Incomplete(PathBuf),
    /// Not transferred
    Failed(String),
}

impl TelemetryTransfer {
    /// Whether the file is usable for the run.
    pub fn is_complete(&self) -> bool {
        matches!(self, TelemetryTransfer::Complete(_))
    }
}

/// Pulls run artifacts from parties and collectors into the local run folder.
pub struct ArtifactCollector<'a, E: RemoteExecutor + ?Sized> {
    executor: &'a E,
    remote_results_dir: String,
    remote_power_dir: String,
}

impl<'a, E: RemoteExecutor + ?Sized> ArtifactCollector<'a, E> {
    /// Collector over `executor`, with remote directories relative to the remote workdir.
    pub fn new(executor: &'a E, remote_results_dir: &str, remote_power_dir: &str) -> Self {
        Self {
            executor,
            remote_results_dir: remote_results_dir.trim_end_matches('/').to_string(),
            remote_power_dir: remote_power_dir.trim_end_matches('/').to_string(),
        }
    }

    /// Remote path of a collector's measurement file for `descriptor`.
    pub fn measurement_path(&self, collector: &PowerCollector, descriptor: &ExperimentDescriptor) -> String {
        format!(
            "{}/{}.csv",
            self.remote_power_dir,
            collector.measurement_name(&descriptor.folder_name())
        )
    }

    /// Copy the party's result folder for `descriptor` into `run_dir`.
    ///
    /// The folder is first checked for with a fresh token so login banners
    /// cannot fake a match. Contents are staged under `run_dir/<identity>`,
    /// merged up one level, and the staging folder removed.
    pub async fn collect_party(
        &self,
        party: &Party,
        descriptor: &ExperimentDescriptor,
        run_dir: &Path,
    ) -> AppResult<PartyArtifacts> {
        let device = party.device();
        let remote_folder = format!("{}/{}", self.remote_results_dir, descriptor.folder_name());

        let token = probe_token();
        let check = self
            .executor
            .run(&device, &[format!("[ -d {} ] && echo {}", remote_folder, token)])
            .await?;
        if !check.stdout.contains(&token) {
            warn!("{} has no results at {}", party.identity, remote_folder);
            return Ok(PartyArtifacts::Missing);
        }

        let staging = run_dir.join(&party.identity);
        fs::create_dir_all(&staging)?;
        self.executor.fetch(&device, &remote_folder, &staging).await?;

        let fetched = staging.join(descriptor.folder_name());
        let source = if fetched.is_dir() { fetched } else { staging.clone() };
        let files = merge_into(&source, run_dir)?;
        fs::remove_dir_all(&staging)?;

        info!("Collected {} file(s) from {}", files, party.identity);
        Ok(PartyArtifacts::Collected { files })
    }

    /// Copy the collector's measurement file into `run_dir` and inspect it.
    pub async fn collect_telemetry(
        &self,
        collector: &PowerCollector,
        descriptor: &ExperimentDescriptor,
        run_dir: &Path,
    ) -> TelemetryTransfer {
        let remote = self.measurement_path(collector, descriptor);
        if let Err(err) = self.executor.fetch(&collector.device(), &remote, run_dir).await {
            warn!("Measurement transfer from {} failed: {}", collector.identity, err);
            return TelemetryTransfer::Failed(err.to_string());
        }

        let local = run_dir.join(format!(
            "{}.csv",
            collector.measurement_name(&descriptor.folder_name())
        ));
        match MeasurementLog::is_complete(&local) {
            Ok(true) => TelemetryTransfer::Complete(local),
            Ok(false) => {
                warn!("Measurement file from {} is incomplete", collector.identity);
                TelemetryTransfer::Incomplete(local)
            }
            Err(err) => TelemetryTransfer::Failed(err.to_string()),
        }
    }
}

/// Move every entry of `src` into `dst`, merging directories and overwriting
/// files. Returns the number of files moved.
fn merge_into(src: &Path, dst: &Path) -> AppResult<usize> {
    fs::create_dir_all(dst)?;
    let mut moved = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            moved += merge_into(&entry.path(), &target)?;
        } else {
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            }
            fs::rename(entry.path(), &target)?;
            debug!("merged {}", target.display());
            moved += 1;
        }
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;
    use crate::remote::MockExecutor;
    use crate::telemetry::COMPLETE_TRAILER;
    use crate::topology::tests::sample_topology;

    fn descriptor() -> ExperimentDescriptor {
        ExperimentDescriptor::builder("v0.6", "tf-cnn", "FedAvg", "mnist")
            .num_parties(Some(2))
            .run(Some(1))
            .build()
    }

    #[tokio::test]
    async fn party_results_are_merged_up_one_level() {
        let topology = sample_topology(2);
        let party = &topology.parties()[0];
        let folder = descriptor().folder_name();

        let mock = MockExecutor::new();
        mock.add_remote_file("rpi1", &format!("Outputs/Experiments/{}/metrics.json", folder), b"{}");
        mock.add_remote_file("rpi1", &format!("Outputs/Experiments/{}/logs/train.log", folder), b"ok");

        let run_dir = tempfile::tempdir().unwrap();
        std::fs::write(run_dir.path().join("metrics.json"), b"stale").unwrap();

        let collector = ArtifactCollector::new(&mock, "Outputs/Experiments", "Outputs/Power");
        let outcome = collector
            .collect_party(party, &descriptor(), run_dir.path())
            .await
            .unwrap();

        assert_eq!(outcome, PartyArtifacts::Collected { files: 2 });
        assert_eq!(std::fs::read(run_dir.path().join("metrics.json")).unwrap(), b"{}");
        assert!(run_dir.path().join("logs/train.log").exists());
        assert!(!run_dir.path().join("rpi1").exists());
    }

    #[tokio::test]
    async fn missing_party_folder_skips_transfer() {
        let topology = sample_topology(1);
        let mock = MockExecutor::new();
        let run_dir = tempfile::tempdir().unwrap();

        let collector = ArtifactCollector::new(&mock, "Outputs/Experiments", "Outputs/Power");
        let outcome = collector
            .collect_party(&topology.parties()[0], &descriptor(), run_dir.path())
            .await
            .unwrap();

        assert_eq!(outcome, PartyArtifacts::Missing);
        assert!(mock.calls().iter().all(|c| c.kind != crate::remote::mock::CallKind::Fetch));
    }

    #[tokio::test]
    async fn banner_text_does_not_count_as_existence() {
        let topology = sample_topology(1);
        let mock = MockExecutor::new();
        mock.respond("[ -d", crate::remote::CommandOutput::ok("Welcome to Raspbian\nexists\n"));
        let run_dir = tempfile::tempdir().unwrap();

        let collector = ArtifactCollector::new(&mock, "Outputs/Experiments", "Outputs/Power");
        let outcome = collector
            .collect_party(&topology.parties()[0], &descriptor(), run_dir.path())
            .await
            .unwrap();
        assert_eq!(outcome, PartyArtifacts::Missing);
    }

    #[tokio::test]
    async fn telemetry_outcomes_follow_the_trailer() {
        let topology = sample_topology(1);
        let node = &topology.collectors()[0];
        let mock = MockExecutor::new();
        let collector = ArtifactCollector::new(&mock, "Outputs/Experiments", "Outputs/Power");
        let remote = collector.measurement_path(node, &descriptor());
        let run_dir = tempfile::tempdir().unwrap();

        let failed = collector
            .collect_telemetry(node, &descriptor(), run_dir.path())
            .await;
        assert!(matches!(failed, TelemetryTransfer::Failed(_)));

        mock.add_remote_file("pi2", &remote, b"timestamp,voltage\n");
        let partial = collector
            .collect_telemetry(node, &descriptor(), run_dir.path())
            .await;
        assert!(matches!(partial, TelemetryTransfer::Incomplete(_)));

        let contents = format!("timestamp,voltage\n{}\n", COMPLETE_TRAILER);
        mock.add_remote_file("pi2", &remote, contents.as_bytes());
        let complete = collector
            .collect_telemetry(node, &descriptor(), run_dir.path())
            .await;
        assert!(complete.is_complete());
    }

    #[tokio::test]
    async fn transfer_failure_is_reported_for_parties() {
        let topology = sample_topology(1);
        let mock = MockExecutor::new();
        mock.add_remote_file(
            "rpi1",
            &format!("Outputs/Experiments/{}/m.json", descriptor().folder_name()),
            b"{}",
        );
        mock.fail_fetches_from("rpi1");
        let run_dir = tempfile::tempdir().unwrap();

        let collector = ArtifactCollector::new(&mock, "Outputs/Experiments", "Outputs/Power");
        let err = collector
            .collect_party(&topology.parties()[0], &descriptor(), run_dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Transfer { .. }));
    }
}
