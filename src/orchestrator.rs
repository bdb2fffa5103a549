//! Run-level state machine.
//!
//! One [`Orchestrator`] drives every experiment of a campaign, one run at a
//! time. A run walks these states in order:
//!
//! ```text
//! INIT -> PREPARE -> LIVENESS_CHECK -> PAIR_TELEMETRY -> START_AUX -> START_CLIENTS
//!      -> AWAIT_TRAINING -> STOP_AUX -> COLLECT_ARTIFACTS -> VALIDATE -> FINALIZE -> COOLDOWN
//! ```
//!
//! A failed liveness check jumps straight to FINALIZE and takes the long
//! cooldown; nothing is started on any device. Once auxiliary sampling has
//! started, STOP_AUX always runs, even when training failed. A collector
//! whose pairing or measurement transfer fails is remediated: it gets one
//! reboot command and its pairing cache entry is cleared so the next run
//! pairs it again.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::artifacts::{ArtifactCollector, PartyArtifacts, TelemetryTransfer};
use crate::bus::{barrier_wait, BusPublisher, BusSubscriber, Signal};
use crate::config::{expand, Settings};
use crate::error::{AppResult, FleetError};
use crate::error_recovery::with_retry;
use crate::experiment::ExperimentDescriptor;
use crate::ledger::{Ledger, RunStatus};
use crate::remote::{RemoteExecutor, RemoteTaskHandle};
use crate::topology::{FleetTopology, PairingCache, PowerCollector};
use crate::training::{TrainingCoordinator, TrainingRequest};

/// States of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Ledger row marked running
    Init,
    /// Run folder created
    Prepare,
    /// Every party answers
    LivenessCheck,
    /// Collectors paired with their testers
    PairTelemetry,
    /// Control bus up and collectors sampling
    StartAux,
    /// Training workers spawned on the parties
    StartClients,
    /// Training coordinator running
    AwaitTraining,
    /// Stop signal published and samplers stopped
    StopAux,
    /// Party results and measurement files transferred
    CollectArtifacts,
    /// Measurement files checked for completion
    Validate,
    /// Outcome written to the ledger
    Finalize,
    /// Pause before the next run
    Cooldown,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "INIT",
            RunState::Prepare => "PREPARE",
            RunState::LivenessCheck => "LIVENESS_CHECK",
            RunState::PairTelemetry => "PAIR_TELEMETRY",
            RunState::StartAux => "START_AUX",
            RunState::StartClients => "START_CLIENTS",
            RunState::AwaitTraining => "AWAIT_TRAINING",
            RunState::StopAux => "STOP_AUX",
            RunState::CollectArtifacts => "COLLECT_ARTIFACTS",
            RunState::Validate => "VALIDATE",
            RunState::Finalize => "FINALIZE",
            RunState::Cooldown => "COOLDOWN",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step succeeded and every measurement is complete
    Finished,
    /// At least one failure was recorded
    Failed,
}

/// What happened during one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Experiment this run executed
    pub descriptor: ExperimentDescriptor,
    /// Final outcome
    pub outcome: RunOutcome,
    /// Local folder holding the run's artifacts
    pub run_dir: PathBuf,
    /// States entered, in order
    pub states: Vec<RunState>,
    /// Why the run failed, one entry per cause
    pub failures: Vec<String>,
    /// Collectors that received a reboot command
    pub remediated: Vec<String>,
    /// Result collection per party identity
    pub party_artifacts: Vec<(String, PartyArtifacts)>,
    /// Measurement transfer per collector identity
    pub telemetry: Vec<(String, TelemetryTransfer)>,
}

impl RunReport {
    fn new(descriptor: &ExperimentDescriptor, run_dir: PathBuf) -> Self {
        Self {
            descriptor: descriptor.clone(),
            outcome: RunOutcome::Failed,
            run_dir,
            states: Vec::new(),
            failures: Vec::new(),
            remediated: Vec::new(),
            party_artifacts: Vec::new(),
            telemetry: Vec::new(),
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(state = %state, "{}", self.descriptor);
        self.states.push(state);
    }

    fn fail(&mut self, reason: String) {
        warn!("Run marked failed: {}", reason);
        self.failures.push(reason);
    }
}

/// Totals of one campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSummary {
    /// Descriptors given
    pub total: usize,
    /// Already finished in the ledger
    pub skipped: usize,
    /// Runs that finished
    pub finished: usize,
    /// Runs that failed
    pub failed: usize,
}

fn vars(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Sequential driver of experiment runs.
pub struct Orchestrator<E, T> {
    topology: FleetTopology,
    settings: Settings,
    executor: E,
    trainer: T,
    ledger: Ledger,
    pairing: PairingCache,
}

impl<E: RemoteExecutor, T: TrainingCoordinator> Orchestrator<E, T> {
    /// Driver over `topology` recording outcomes in `ledger`.
    pub fn new(
        topology: FleetTopology,
        settings: Settings,
        executor: E,
        trainer: T,
        ledger: Ledger,
    ) -> Self {
        Self {
            topology,
            settings,
            executor,
            trainer,
            ledger,
            pairing: PairingCache::new(),
        }
    }

    /// Ledger the outcomes are written to.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Collectors currently paired with their testers.
    pub fn pairing(&self) -> &PairingCache {
        &self.pairing
    }

    /// Fleet this driver runs on.
    pub fn topology(&self) -> &FleetTopology {
        &self.topology
    }

    /// Run every descriptor not yet finished, in order.
    ///
    /// Each descriptor is (re)entered into the ledger before its run, so
    /// every generated descriptor ends up finished or failed.
    pub async fn run_campaign(
        &mut self,
        descriptors: &[ExperimentDescriptor],
        rerun_finished: bool,
    ) -> AppResult<CampaignSummary> {
        let mut summary = CampaignSummary {
            total: descriptors.len(),
            ..CampaignSummary::default()
        };
        let mut registered: Vec<&str> = Vec::new();

        for descriptor in descriptors {
            if !registered.contains(&descriptor.version()) {
                self.ledger.register_version(descriptor.version())?;
                registered.push(descriptor.version());
            }
            if self.ledger.status(descriptor)? == RunStatus::Finished && !rerun_finished {
                info!("Skipping finished experiment {}", descriptor);
                summary.skipped += 1;
                continue;
            }

            self.ledger.upsert(descriptor)?;
            let report = self.run_experiment(descriptor).await?;
            match report.outcome {
                RunOutcome::Finished => summary.finished += 1,
                RunOutcome::Failed => summary.failed += 1,
            }
        }

        info!(
            "Campaign done: {} finished, {} failed, {} skipped of {}",
            summary.finished, summary.failed, summary.skipped, summary.total
        );
        Ok(summary)
    }

    /// Drive one run through the full state machine.
    pub async fn run_experiment(&mut self, descriptor: &ExperimentDescriptor) -> AppResult<RunReport> {
        let run_dir = self
            .settings
            .paths
            .results_dir
            .join(descriptor.folder_name());
        let mut report = RunReport::new(descriptor, run_dir);

        match self.drive(descriptor, &mut report).await {
            Ok(()) => Ok(report),
            Err(err) => {
                error!("Run aborted in {:?}: {}", report.states.last(), err);
                if let Err(ledger_err) = self.ledger.set_failed(descriptor) {
                    error!("Could not record failure: {}", ledger_err);
                }
                Err(err)
            }
        }
    }

    async fn drive(&mut self, descriptor: &ExperimentDescriptor, report: &mut RunReport) -> AppResult<()> {
        report.enter(RunState::Init);
        sleep(self.settings.timing.pre_run_delay).await;

        report.enter(RunState::Prepare);
        self.ledger.set_running(descriptor)?;
        if report.run_dir.exists() {
            std::fs::remove_dir_all(&report.run_dir)?;
        }
        std::fs::create_dir_all(&report.run_dir)?;

        report.enter(RunState::LivenessCheck);
        if let Err(err) = self.check_liveness().await {
            error!("Liveness check failed: {}", err);
            report.fail(err.to_string());
            return self.finish(descriptor, report, true).await;
        }

        report.enter(RunState::PairTelemetry);
        let paired = self.pair_collectors(report).await;

        report.enter(RunState::StartAux);
        let publisher = match self.start_aux(descriptor, &paired).await {
            Ok(publisher) => publisher,
            Err(err) => {
                report.fail(format!("auxiliary start failed: {}", err));
                return self.finish(descriptor, report, false).await;
            }
        };

        report.enter(RunState::StartClients);
        let workers = self.start_clients(descriptor, report).await;

        report.enter(RunState::AwaitTraining);
        let request = TrainingRequest::for_descriptor(
            descriptor,
            self.declared_parties(descriptor),
            report.run_dir.clone(),
        );
        if let Err(err) = self.trainer.train(&request).await {
            report.fail(err.to_string());
        }
        info!("Training phase returned");

        report.enter(RunState::StopAux);
        self.stop_aux(descriptor, publisher).await;
        let run_folder = descriptor.folder_name();
        for worker in workers.iter().filter(|w| !w.is_finished()) {
            match worker.still_running(&self.executor, &run_folder).await {
                Ok(true) => warn!("Worker on {} still running after training", worker.device()),
                Ok(false) => {}
                Err(err) => warn!("Could not re-probe worker on {}: {}", worker.device(), err),
            }
        }

        report.enter(RunState::CollectArtifacts);
        let collector = ArtifactCollector::new(
            &self.executor,
            &self.settings.paths.remote_results_dir,
            &self.settings.paths.remote_power_dir,
        );
        for party in self.topology.parties() {
            match collector.collect_party(party, descriptor, &report.run_dir).await {
                Ok(outcome) => report.party_artifacts.push((party.identity.clone(), outcome)),
                Err(err) => warn!("Results of {} not collected: {}", party.identity, err),
            }
        }
        for node in &paired {
            let transfer = collector
                .collect_telemetry(node, descriptor, &report.run_dir)
                .await;
            report.telemetry.push((node.identity.clone(), transfer));
        }

        report.enter(RunState::Validate);
        let broken: Vec<(PowerCollector, String)> = report
            .telemetry
            .iter()
            .filter(|(_, transfer)| !transfer.is_complete())
            .filter_map(|(identity, transfer)| {
                paired
                    .iter()
                    .find(|c| &c.identity == identity)
                    .map(|c| (c.clone(), format!("{:?}", transfer)))
            })
            .collect();
        for (node, transfer) in broken {
            report.fail(format!(
                "measurement from {} unusable: {}",
                node.identity, transfer
            ));
            self.remediate(&node, report).await;
        }

        self.finish(descriptor, report, false).await
    }

    /// FINALIZE and COOLDOWN.
    async fn finish(
        &mut self,
        descriptor: &ExperimentDescriptor,
        report: &mut RunReport,
        long_cooldown: bool,
    ) -> AppResult<()> {
        report.enter(RunState::Finalize);
        if report.failures.is_empty() {
            self.ledger.set_finished(descriptor)?;
            report.outcome = RunOutcome::Finished;
        } else {
            self.ledger.set_failed(descriptor)?;
            report.outcome = RunOutcome::Failed;
        }

        report.enter(RunState::Cooldown);
        let timing = &self.settings.timing;
        let cooldown = if long_cooldown {
            timing.long_cooldown
        } else {
            timing.short_cooldown
        };
        info!("Run {:?}; cooling down for {:?}", report.outcome, cooldown);
        sleep(cooldown).await;
        Ok(())
    }

    /// Probe every party concurrently; the first failure in roster order wins.
    async fn check_liveness(&self) -> AppResult<()> {
        let devices: Vec<_> = self.topology.parties().iter().map(|p| p.device()).collect();
        let probes = devices
            .iter()
            .map(|device| self.executor.probe(device, &self.settings.timing.probe));
        join_all(probes).await.into_iter().collect()
    }

    fn collector_vars(&self, collector: &PowerCollector) -> HashMap<String, String> {
        vars(&[
            ("identity", collector.identity.clone()),
            ("tester_address", collector.tester_address.clone()),
            ("serial_device", collector.serial_device.clone()),
        ])
    }

    /// Pair every collector not already paired. Returns the collectors
    /// usable for sampling this run.
    async fn pair_collectors(&mut self, report: &mut RunReport) -> Vec<PowerCollector> {
        let mut usable = Vec::new();
        for collector in self.topology.collectors().to_vec() {
            if self.pairing.is_paired(&collector.identity) {
                usable.push(collector);
                continue;
            }

            let command = match expand(&self.settings.commands.pairing, &self.collector_vars(&collector)) {
                Ok(command) => command,
                Err(err) => {
                    report.fail(err.to_string());
                    continue;
                }
            };
            let device = collector.device();
            let executor = &self.executor;
            let what = format!("pairing {} to its tester", collector.identity);
            let result = with_retry(&self.settings.timing.pairing, &what, |_| {
                let command = command.clone();
                let device = device.clone();
                async move {
                    let output = executor.run(&device, &[command]).await?;
                    if output.success() {
                        Ok(())
                    } else {
                        Err(FleetError::connectivity(
                            device.identity.clone(),
                            format!("pairing exited with {}: {}", output.exit_code, output.stderr.trim()),
                        ))
                    }
                }
            })
            .await;

            match result {
                Ok(()) => {
                    info!("{} was paired to tester {}", collector.identity, collector.tester_address);
                    self.pairing.mark_paired(&collector.identity);
                    usable.push(collector);
                }
                Err(err) => {
                    report.fail(format!("{} could not pair: {}", collector.identity, err));
                    self.remediate(&collector, report).await;
                }
            }
        }
        usable
    }

    /// Reboot a collector and forget its pairing.
    async fn remediate(&mut self, collector: &PowerCollector, report: &mut RunReport) {
        warn!("Remediating collector {}", collector.identity);
        match expand(&self.settings.commands.reboot, &self.collector_vars(collector)) {
            Ok(command) => {
                // A reboot usually drops the session, so the result is not checked.
                if let Err(err) = self.executor.run(&collector.device(), &[command]).await {
                    warn!("Reboot of {} reported: {}", collector.identity, err);
                }
            }
            Err(err) => error!("Reboot command unusable: {}", err),
        }
        self.pairing.invalidate(&collector.identity);
        report.remediated.push(collector.identity.clone());
    }

    async fn start_aux(
        &self,
        descriptor: &ExperimentDescriptor,
        paired: &[PowerCollector],
    ) -> AppResult<BusPublisher> {
        let aggregator = self.topology.aggregator();
        let publisher = BusPublisher::bind(&aggregator.bus_endpoint()).await?;
        let bus_endpoint = format!("{}:{}", aggregator.address, publisher.local_addr().port());

        // Collectors spawned before a failure must not outlive the run.
        if let Err(err) = self.spawn_aux(descriptor, paired, &bus_endpoint) {
            let reached = publisher.publish_signal(Signal::StopPowerCollection).await;
            warn!(
                "Auxiliary start failed, stop sent to {} collector(s): {}",
                reached, err
            );
            publisher.shutdown().await;
            return Err(err);
        }

        sleep(self.settings.timing.sampler_warmup).await;
        if let Err(err) = publisher
            .wait_for_subscribers(paired.len(), self.settings.timing.subscriber_wait)
            .await
        {
            warn!("Continuing without every collector on the bus: {}", err);
        }
        Ok(publisher)
    }

    fn spawn_aux(
        &self,
        descriptor: &ExperimentDescriptor,
        paired: &[PowerCollector],
        bus_endpoint: &str,
    ) -> AppResult<()> {
        let collector = ArtifactCollector::new(
            &self.executor,
            &self.settings.paths.remote_results_dir,
            &self.settings.paths.remote_power_dir,
        );
        let telemetry_vars = self.settings.telemetry.template_vars();
        for node in paired {
            let mut template_vars = self.collector_vars(node);
            template_vars.extend(vars(&telemetry_vars));
            template_vars.extend(vars(&[
                ("party", node.party.clone()),
                ("bus_endpoint", bus_endpoint.to_string()),
                ("output", collector.measurement_path(node, descriptor)),
            ]));
            let command = expand(&self.settings.commands.collector_sampling, &template_vars)?;
            self.executor.spawn(&node.device(), &[command])?;
        }
        info!("Power collection started on {} collector(s)", paired.len());

        if let Some(template) = &self.settings.commands.sampler_start {
            for device in self.topology.compute_devices() {
                let command = expand(
                    template,
                    &vars(&[
                        ("identity", device.identity.clone()),
                        ("run_folder", descriptor.folder_name()),
                    ]),
                )?;
                self.executor.spawn(&device, &[command])?;
            }
            info!("Resource sampler started");
        }
        Ok(())
    }

    fn declared_parties(&self, descriptor: &ExperimentDescriptor) -> u32 {
        descriptor
            .num_parties()
            .unwrap_or(self.topology.parties().len() as u32)
    }

    /// Spawn every worker without waiting on any of them, then optionally
    /// hold until each party has signalled readiness.
    async fn start_clients(
        &self,
        descriptor: &ExperimentDescriptor,
        report: &mut RunReport,
    ) -> Vec<RemoteTaskHandle> {
        let aggregator = self.topology.aggregator();
        let timing = &self.settings.timing;

        let mut ready_signals = Vec::new();
        if timing.await_party_ready {
            for party in self.topology.parties() {
                let Some(port) = party.signal_port else { continue };
                match BusSubscriber::connect(&format!("{}:{}", party.address, port)).await {
                    Ok(subscriber) => ready_signals.push(subscriber),
                    Err(err) => warn!("No readiness signal from {}: {}", party.identity, err),
                }
            }
        }

        let mut workers = Vec::new();
        for (cid, party) in self.topology.parties().iter().enumerate() {
            let command = expand(
                &self.settings.commands.party_worker,
                &vars(&[
                    ("identity", party.identity.clone()),
                    ("address", party.address.clone()),
                    ("cid", cid.to_string()),
                    ("dataset", descriptor.dataset().to_string()),
                    ("num_parties", self.declared_parties(descriptor).to_string()),
                    ("aggregator_address", aggregator.address.clone()),
                    ("training_port", aggregator.training_port.to_string()),
                    ("run_folder", descriptor.folder_name()),
                ]),
            );
            match command.and_then(|command| self.executor.spawn(&party.device(), &[command])) {
                Ok(handle) => workers.push(handle),
                Err(err) => report.fail(format!("worker on {} not started: {}", party.identity, err)),
            }
        }
        info!("Issued start to {} worker(s)", workers.len());

        if !ready_signals.is_empty() {
            match barrier_wait(&mut ready_signals, Signal::PartyStarted.code(), &timing.barrier).await {
                Ok(sweeps) => info!("All parties ready after {} sweep(s)", sweeps),
                Err(err) => warn!("Readiness barrier broken: {}", err),
            }
        }
        workers
    }

    async fn stop_aux(&self, descriptor: &ExperimentDescriptor, publisher: BusPublisher) {
        sleep(self.settings.timing.post_training_delay).await;
        let reached = publisher.publish_signal(Signal::StopPowerCollection).await;
        info!("Stop signal sent to {} collector(s)", reached);

        if let Some(template) = &self.settings.commands.sampler_stop {
            for device in self.topology.compute_devices() {
                let command = expand(
                    template,
                    &vars(&[
                        ("identity", device.identity.clone()),
                        ("run_folder", descriptor.folder_name()),
                    ]),
                );
                let result = match command {
                    Ok(command) => self.executor.run(&device, &[command]).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    warn!("Resource sampler on {} not stopped: {}", device, err);
                }
            }
        }
        publisher.shutdown().await;
    }
}
