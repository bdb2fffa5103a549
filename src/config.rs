//! Campaign configuration using Figment
//!
//! Settings are layered, lowest to highest precedence:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (by default `config/energy_fl.toml`)
//! 3. Environment variables prefixed with `ENERGYFL_`, nested with `__`
//!
//! ```text
//! ENERGYFL_APPLICATION__LOG_LEVEL=debug
//! ENERGYFL_TIMING__LONG_COOLDOWN=2m
//! ENERGYFL_CAMPAIGN__RERUN_FINISHED=true
//! ```
//!
//! Settings are built once before a campaign starts and never change while
//! it runs. Remote commands are [`strfmt`] templates with named placeholders;
//! the placeholders each template may use are listed on [`CommandTemplates`].
//!
//! # Example
//!
//! ```no_run
//! use energy_fl::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! let topology = settings.topology()?;
//! println!("{} parties", topology.parties().len());
//! # Ok::<(), energy_fl::error::FleetError>(())
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::bus::BarrierPolicy;
use crate::error::{AppResult, FleetError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::{Catalog, ParameterGrid};
use crate::logging::LogFormat;
use crate::remote::SshSettings;
use crate::telemetry::SamplingSettings;
use crate::topology::{Aggregator, FleetTopology, Party, PowerCollector};

/// Configuration file read when no path is given and it exists.
pub const DEFAULT_CONFIG_PATH: &str = "config/energy_fl.toml";
/// Prefix of environment overrides; `__` separates nested keys.
pub const ENV_PREFIX: &str = "ENERGYFL_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Process-wide settings
    pub application: ApplicationSettings,
    /// Local and remote locations
    pub paths: PathSettings,
    /// Remote command transport
    pub remote: SshSettings,
    /// Aggregator, parties and power collectors
    pub fleet: FleetSettings,
    /// Known datasets, models and fusions
    pub catalog: Catalog,
    /// Parameter sweep
    pub campaign: CampaignSettings,
    /// Retries, delays and cooldowns of a run
    pub timing: TimingSettings,
    /// Command templates run on the fleet
    pub commands: CommandTemplates,
    /// Power collector settings
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Process-wide settings.
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
    /// Log line format
    pub log_format: LogFormat,
    /// Version tag stamped on generated descriptors
    pub experiment_version: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "energy_fl".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            experiment_version: "0.6.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Local and remote locations.
pub struct PathSettings {
    /// Local directory holding one folder per run
    pub results_dir: PathBuf,
    /// Ledger database file
    pub ledger_path: PathBuf,
    /// Per-run result folders on the parties, relative to the remote workdir
    pub remote_results_dir: String,
    /// Measurement files on the collectors, relative to the remote workdir
    pub remote_power_dir: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("Outputs/Experiments"),
            ledger_path: PathBuf::from("Outputs/ledger.sqlite3"),
            remote_results_dir: "Outputs/Experiments".to_string(),
            remote_power_dir: "Outputs/Power".to_string(),
        }
    }
}

/// Raw fleet description; see [`Settings::topology`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Host running the training coordinator and the control bus
    pub aggregator: Aggregator,
    /// Training parties in roster order
    pub parties: Vec<Party>,
    /// Power collectors, each measuring one party
    pub collectors: Vec<PowerCollector>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            aggregator: Aggregator {
                identity: "user".to_string(),
                address: "127.0.0.1".to_string(),
                training_port: 8080,
                broadcast_port: 5555,
            },
            parties: Vec::new(),
            collectors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Parameter sweep of a campaign.
pub struct CampaignSettings {
    /// Datasets to sweep; empty means every catalog dataset
    pub datasets: Vec<String>,
    /// Models to sweep; empty means every catalog model
    pub models: Vec<String>,
    /// Fusions to sweep; empty means every catalog fusion
    pub fusions: Vec<String>,
    /// (rounds, epochs) pairs to sweep
    pub rounds_and_epochs: Vec<(u32, u32)>,
    /// Batch sizes to sweep
    pub batch_sizes: Vec<u32>,
    /// Repetitions of every combination
    pub runs: u32,
    /// Declared party count; must match the roster when set
    pub num_parties: Option<u32>,
    /// Fraction of parties sampled per round
    pub sample_fraction: f64,
    /// Run descriptors again even when the ledger has them finished
    pub rerun_finished: bool,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            datasets: Vec::new(),
            models: Vec::new(),
            fusions: Vec::new(),
            rounds_and_epochs: vec![(2, 2)],
            batch_sizes: vec![16, 512],
            runs: 3,
            num_parties: None,
            sample_fraction: 1.0,
            rerun_finished: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Retries, delays and cooldowns of a run.
pub struct TimingSettings {
    /// Liveness probe attempts per party
    pub probe: RetryPolicy,
    /// Pairing attempts per collector
    pub pairing: RetryPolicy,
    /// Pause before a run starts
    #[serde(with = "humantime_serde")]
    pub pre_run_delay: Duration,
    /// Pause between starting auxiliary sampling and starting the workers
    #[serde(with = "humantime_serde")]
    pub sampler_warmup: Duration,
    /// Pause between training returning and stopping auxiliary sampling
    #[serde(with = "humantime_serde")]
    pub post_training_delay: Duration,
    /// How long to wait for collectors to subscribe to the bus
    #[serde(with = "humantime_serde")]
    pub subscriber_wait: Duration,
    #[serde(with = "humantime_serde")]
    /// Cooldown after a run that reached training
    pub short_cooldown: Duration,
    /// Cooldown after a liveness failure
    #[serde(with = "humantime_serde")]
    pub long_cooldown: Duration,
    /// Wait for every party to signal readiness before training
    pub await_party_ready: bool,
    /// Polling of readiness barriers
    pub barrier: BarrierPolicy,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            probe: RetryPolicy::new(3, Duration::from_secs(2)),
            pairing: RetryPolicy::new(3, Duration::from_secs(5)),
            pre_run_delay: Duration::from_secs(3),
            sampler_warmup: Duration::from_secs(5),
            post_training_delay: Duration::from_secs(1),
            subscriber_wait: Duration::from_secs(10),
            short_cooldown: Duration::from_secs(10),
            long_cooldown: Duration::from_secs(60),
            await_party_ready: false,
            barrier: BarrierPolicy::default(),
        }
    }
}

/// Remote and local command templates.
///
/// Placeholders:
///
/// - `party_worker`: `identity`, `address`, `cid`, `dataset`, `num_parties`,
///   `aggregator_address`, `training_port`, `run_folder`
/// - `collector_sampling`: `identity`, `party`, `tester_address`,
///   `serial_device`, `bus_endpoint`, `output`, plus the `[telemetry]`
///   values `interval_ms`, `max_errors`, `error_backoff_ms`, `baud_rate`,
///   `read_timeout_ms`, `handshake_attempts`, `handshake_backoff_ms`
/// - `pairing`, `reboot`: `identity`, `tester_address`, `serial_device`
/// - `sampler_start`, `sampler_stop`: `identity`, `run_folder`
/// - `training`: `rounds`, `epochs`, `batch_size`, `dataset`, `fusion`,
///   `model`, `sample_fraction`, `proximal_mu`, `min_parties`, `run`,
///   `result_dir`, `training_port`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    /// Training worker started on every party
    pub party_worker: String,
    /// Sampling process started on every paired collector
    pub collector_sampling: String,
    /// Pairs a collector with its tester
    pub pairing: String,
    /// Remediation of a failed collector
    pub reboot: String,
    /// Resource sampler started on every compute device, if set
    pub sampler_start: Option<String>,
    /// Stops the resource sampler, if set
    pub sampler_stop: Option<String>,
    /// Local training coordinator command
    pub training: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            party_worker: "python -m clients.scripts.old_client --agg_ip {aggregator_address} \
                --agg_port {training_port} --cid {cid} --dataset {dataset} --client_ip {address} \
                --num_parties {num_parties} --pi_name {identity} --expt_name {run_folder}"
                .to_string(),
            collector_sampling: "./target/release/power_collector --bus {bus_endpoint} \
                --port {serial_device} --output {output} --interval-ms {interval_ms} \
                --max-errors {max_errors} --error-backoff-ms {error_backoff_ms} \
                --baud-rate {baud_rate} --read-timeout-ms {read_timeout_ms} \
                --handshake-attempts {handshake_attempts} \
                --handshake-backoff-ms {handshake_backoff_ms} \
                --collector {identity} --party {party} --tester {tester_address}"
                .to_string(),
            pairing: "./clients/scripts/connect_to_bt_multimeter.sh {tester_address}".to_string(),
            reboot: "sudo reboot".to_string(),
            sampler_start: None,
            sampler_stop: None,
            training: "python -m clients.scripts.old_server --rounds {rounds} --epochs {epochs} \
                --batch_size {batch_size} --dataset {dataset} --fusion {fusion} --model {model} \
                --sample_fraction {sample_fraction} --proximal_mu {proximal_mu} \
                --min_parties {min_parties} --run {run} --result_dir {result_dir}"
                .to_string(),
        }
    }
}

const PARTY_WORKER_KEYS: &[&str] = &[
    "identity",
    "address",
    "cid",
    "dataset",
    "num_parties",
    "aggregator_address",
    "training_port",
    "run_folder",
];
const COLLECTOR_SAMPLING_KEYS: &[&str] = &[
    "identity",
    "party",
    "tester_address",
    "serial_device",
    "bus_endpoint",
    "output",
    "interval_ms",
    "max_errors",
    "error_backoff_ms",
    "baud_rate",
    "read_timeout_ms",
    "handshake_attempts",
    "handshake_backoff_ms",
];
const COLLECTOR_KEYS: &[&str] = &["identity", "tester_address", "serial_device"];
const SAMPLER_KEYS: &[&str] = &["identity", "run_folder"];
const TRAINING_KEYS: &[&str] = &[
    "rounds",
    "epochs",
    "batch_size",
    "dataset",
    "fusion",
    "model",
    "sample_fraction",
    "proximal_mu",
    "min_parties",
    "run",
    "result_dir",
    "training_port",
];

impl CommandTemplates {
    /// Expand every template with placeholder values so unknown placeholders
    /// surface at load time rather than mid-campaign.
    pub fn check(&self) -> AppResult<()> {
        let mut templates = vec![
            ("party_worker", self.party_worker.as_str(), PARTY_WORKER_KEYS),
            (
                "collector_sampling",
                self.collector_sampling.as_str(),
                COLLECTOR_SAMPLING_KEYS,
            ),
            ("pairing", self.pairing.as_str(), COLLECTOR_KEYS),
            ("reboot", self.reboot.as_str(), COLLECTOR_KEYS),
            ("training", self.training.as_str(), TRAINING_KEYS),
        ];
        if let Some(start) = &self.sampler_start {
            templates.push(("sampler_start", start.as_str(), SAMPLER_KEYS));
        }
        if let Some(stop) = &self.sampler_stop {
            templates.push(("sampler_stop", stop.as_str(), SAMPLER_KEYS));
        }

        for (name, template, keys) in templates {
            let vars: HashMap<String, String> = keys
                .iter()
                .map(|k| (k.to_string(), "x".to_string()))
                .collect();
            expand(template, &vars)
                .map_err(|e| FleetError::Template(format!("commands.{}: {}", name, e)))?;
        }
        Ok(())
    }
}

/// Expand `template` with named placeholders.
pub fn expand(template: &str, vars: &HashMap<String, String>) -> AppResult<String> {
    strfmt::strfmt(template, vars)
        .map_err(|e| FleetError::Template(format!("'{}': {}", template, e)))
}

/// Tester link and sampling settings handed to every power collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Sampling loop pacing and error tolerance
    pub sampling: SamplingSettings,
    /// Handshake attempts when opening the tester link
    pub handshake: RetryPolicy,
    /// Serial line speed
    pub baud_rate: u32,
    /// Longest wait for bytes on one read before it counts as empty
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl TelemetrySettings {
    /// Placeholder values for the `collector_sampling` template.
    pub fn template_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("interval_ms", self.sampling.interval.as_millis().to_string()),
            ("max_errors", self.sampling.max_consecutive_errors.to_string()),
            (
                "error_backoff_ms",
                self.sampling.error_backoff.as_millis().to_string(),
            ),
            ("baud_rate", self.baud_rate.to_string()),
            ("read_timeout_ms", self.read_timeout.as_millis().to_string()),
            ("handshake_attempts", self.handshake.max_attempts.to_string()),
            (
                "handshake_backoff_ms",
                self.handshake.backoff_delay.as_millis().to_string(),
            ),
        ]
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            sampling: SamplingSettings::default(),
            handshake: RetryPolicy::new(10, Duration::from_millis(200)),
            baud_rate: 9600,
            read_timeout: Duration::from_secs(1),
        }
    }
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Settings {
    /// Load from defaults, the TOML file at `path` (or
    /// [`DEFAULT_CONFIG_PATH`] when it exists) and the environment, then
    /// validate.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(FleetError::Configuration(format!(
                        "configuration file '{}' not found",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_PATH)),
        }
        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-section consistency.
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(FleetError::Configuration(format!(
                "invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        if self.campaign.runs == 0 {
            return Err(FleetError::Configuration(
                "campaign.runs must be at least 1".to_string(),
            ));
        }
        if self.campaign.batch_sizes.is_empty() || self.campaign.rounds_and_epochs.is_empty() {
            return Err(FleetError::Configuration(
                "campaign needs at least one batch size and one (rounds, epochs) pair".to_string(),
            ));
        }
        for (list, name) in [
            (&self.catalog.models, "models"),
            (&self.catalog.fusions, "fusions"),
            (&self.catalog.datasets, "datasets"),
        ] {
            if list.is_empty() {
                return Err(FleetError::Configuration(format!(
                    "catalog.{} must not be empty",
                    name
                )));
            }
        }

        let topology = self.topology()?;
        if let Some(declared) = self.campaign.num_parties {
            topology.expect_parties(declared as usize)?;
        }
        self.commands.check()
    }

    /// Build the immutable fleet topology.
    pub fn topology(&self) -> AppResult<FleetTopology> {
        FleetTopology::new(
            self.fleet.aggregator.clone(),
            self.fleet.parties.clone(),
            self.fleet.collectors.clone(),
        )
    }

    /// The campaign's sweep. Empty id lists fall back to the whole catalog,
    /// and the party count defaults to the roster size.
    pub fn parameter_grid(&self) -> ParameterGrid {
        let mut grid = ParameterGrid::from_catalog(&self.application.experiment_version, &self.catalog);
        if !self.campaign.datasets.is_empty() {
            grid.datasets = self.campaign.datasets.clone();
        }
        if !self.campaign.models.is_empty() {
            grid.models = self.campaign.models.clone();
        }
        if !self.campaign.fusions.is_empty() {
            grid.fusions = self.campaign.fusions.clone();
        }
        grid.rounds_and_epochs = self.campaign.rounds_and_epochs.clone();
        grid.batch_sizes = self.campaign.batch_sizes.clone();
        grid.runs = self.campaign.runs;
        grid.num_parties = self
            .campaign
            .num_parties
            .or(Some(self.fleet.parties.len() as u32));
        grid.sample_fraction = self.campaign.sample_fraction;
        grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLEET_TOML: &str = r#"
[application]
log_level = "debug"
experiment_version = "0.7.0"

[fleet.aggregator]
identity = "user"
address = "10.8.1.30"
training_port = 8080
broadcast_port = 5555

[[fleet.parties]]
identity = "rpi1"
address = "10.8.1.41"

[[fleet.parties]]
identity = "rpi2"
address = "10.8.1.42"

[[fleet.collectors]]
identity = "pi2"
address = "10.8.1.35"
party = "rpi1"
tester_address = "98:DA:F0:00:4A:13"

[campaign]
rounds_and_epochs = [[3, 4]]
batch_sizes = [16]
runs = 2
datasets = ["mnist"]
fusions = ["FedAvg"]

[timing]
long_cooldown = "2m"
probe = { max_attempts = 5, backoff_delay = "250ms" }
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_toml_over_defaults() {
        let file = write_config(FLEET_TOML);
        let settings = Settings::load(Some(file.path())).unwrap();

        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.timing.long_cooldown, Duration::from_secs(120));
        assert_eq!(settings.timing.probe.max_attempts, 5);
        assert_eq!(settings.timing.short_cooldown, Duration::from_secs(10));
        assert_eq!(settings.remote.workdir, "~/Energy-FL");

        let topology = settings.topology().unwrap();
        assert_eq!(topology.parties().len(), 2);
        assert_eq!(topology.collectors()[0].broadcast_port, Some(5555));
    }

    #[test]
    fn grid_follows_campaign_section() {
        let file = write_config(FLEET_TOML);
        let settings = Settings::load(Some(file.path())).unwrap();
        let grid = settings.parameter_grid();
        assert_eq!(grid.version, "0.7.0");
        assert_eq!(grid.num_parties, Some(2));
        assert_eq!(grid.models, settings.catalog.models);

        let descriptors = grid.generate(&settings.catalog).unwrap();
        assert_eq!(descriptors.len(), 2);
    }

    #[test]
    fn declared_party_count_must_match_roster() {
        let file = write_config(&format!("{}\n", FLEET_TOML.replace("runs = 2", "runs = 2\nnum_parties = 4")));
        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(matches!(
            err,
            FleetError::ConfigMismatch {
                declared: 4,
                actual: 2
            }
        ));
    }

    #[test]
    fn empty_roster_is_rejected() {
        let err = Settings::default().validate().unwrap_err();
        assert!(matches!(err, FleetError::Configuration(_)));
    }

    #[test]
    fn unknown_placeholder_is_reported() {
        let commands = CommandTemplates {
            reboot: "sudo reboot {when}".to_string(),
            ..CommandTemplates::default()
        };
        let err = commands.check().unwrap_err();
        assert!(err.to_string().contains("commands.reboot"));
    }

    #[test]
    fn default_templates_expand() {
        CommandTemplates::default().check().unwrap();
        let vars: HashMap<String, String> = [("tester_address", "AA:BB")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let cmd = expand(&CommandTemplates::default().pairing, &vars).unwrap();
        assert_eq!(cmd, "./clients/scripts/connect_to_bt_multimeter.sh AA:BB");
    }

    #[test]
    fn telemetry_values_fill_the_collector_template() {
        let mut telemetry = TelemetrySettings::default();
        telemetry.baud_rate = 115_200;
        telemetry.read_timeout = Duration::from_millis(750);
        let vars: HashMap<String, String> = telemetry
            .template_vars()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .chain(
                ["identity", "party", "tester_address", "serial_device", "bus_endpoint", "output"]
                    .iter()
                    .map(|k| (k.to_string(), "x".to_string())),
            )
            .collect();
        assert!(telemetry
            .template_vars()
            .iter()
            .all(|(k, _)| COLLECTOR_SAMPLING_KEYS.contains(k)));

        let cmd = expand(&CommandTemplates::default().collector_sampling, &vars).unwrap();
        assert!(cmd.contains("--baud-rate 115200"));
        assert!(cmd.contains("--read-timeout-ms 750"));
        assert!(cmd.contains("--handshake-attempts 10"));
        assert!(cmd.contains("--max-errors 10"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/energy_fl.toml")));
        assert!(result.is_err());
    }
}
