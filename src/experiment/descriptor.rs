//! Experiment descriptors: the immutable identity of one experiment run.
//!
//! A descriptor captures every hyperparameter that distinguishes one run of the
//! campaign from another, plus the code version and the repetition index. Two
//! descriptors are the same experiment exactly when all fields are equal, and
//! the ledger relies on that through the codec key.
//!
//! Descriptors are assembled with [`DescriptorBuilder`] and never mutated
//! afterwards. Validation against the set of known model, fusion and dataset
//! identifiers is a separate, explicit step ([`ExperimentDescriptor::check_validity`]),
//! because descriptors decoded from an old ledger may predate the current
//! [`Catalog`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, FleetError};
use crate::experiment::codec::{DELIMITER, NONE_TOKEN};

/// Identifiers a descriptor may legally reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Known model identifiers (e.g. "tf-cnn")
    pub models: Vec<String>,
    /// Known fusion algorithm identifiers (e.g. "FedAvg")
    pub fusions: Vec<String>,
    /// Known dataset identifiers (e.g. "mnist")
    pub datasets: Vec<String>,
    /// Fusion algorithms that take a proximal term
    #[serde(default = "default_proximal_fusions")]
    pub proximal_fusions: Vec<String>,
    /// Proximal-mu values swept for proximal fusions
    #[serde(default = "default_proximal_mus")]
    pub proximal_mus: Vec<f64>,
}

fn default_proximal_fusions() -> Vec<String> {
    vec!["FedProx".to_string()]
}

fn default_proximal_mus() -> Vec<f64> {
    vec![1.0]
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            models: vec!["tf-cnn".to_string()],
            fusions: vec!["FedAvg".to_string(), "FedProx".to_string()],
            datasets: vec!["mnist".to_string(), "cifar10".to_string()],
            proximal_fusions: default_proximal_fusions(),
            proximal_mus: default_proximal_mus(),
        }
    }
}

impl Catalog {
    /// Whether `fusion` sweeps the proximal term.
    pub fn is_proximal(&self, fusion: &str) -> bool {
        self.proximal_fusions.iter().any(|f| f == fusion)
    }
}

/// Immutable record fully identifying one experiment configuration and repetition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDescriptor {
    version: String,
    model: String,
    fusion: String,
    dataset: String,
    batch_size: u32,
    rounds: u32,
    epochs: u32,
    sample_fraction: f64,
    proximal_mu: f64,
    num_parties: Option<u32>,
    run: Option<u32>,
}

impl ExperimentDescriptor {
    /// Start building a descriptor. Numeric fields default to a single round
    /// and epoch with batch size 32, full sampling and no proximal term.
    pub fn builder(version: &str, model: &str, fusion: &str, dataset: &str) -> DescriptorBuilder {
        DescriptorBuilder {
            inner: ExperimentDescriptor {
                version: version.to_string(),
                model: model.to_string(),
                fusion: fusion.to_string(),
                dataset: dataset.to_string(),
                batch_size: 32,
                rounds: 1,
                epochs: 1,
                sample_fraction: 1.0,
                proximal_mu: 0.0,
                num_parties: None,
                run: None,
            },
        }
    }

    /// Code version tag.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Aggregation strategy.
    pub fn fusion(&self) -> &str {
        &self.fusion
    }

    /// Dataset name.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Local batch size.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Federated rounds.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Local epochs per round.
    pub fn epochs(&self) -> u32 {
        self.epochs
    }

    /// Fraction of parties sampled per round.
    pub fn sample_fraction(&self) -> f64 {
        self.sample_fraction
    }

    /// Proximal term weight.
    pub fn proximal_mu(&self) -> f64 {
        self.proximal_mu
    }

    /// Declared party count, if any.
    pub fn num_parties(&self) -> Option<u32> {
        self.num_parties
    }

    /// Repetition index, if any.
    pub fn run(&self) -> Option<u32> {
        self.run
    }

    /// Reject descriptors that reference unknown identifiers or carry
    /// out-of-range hyperparameters.
    pub fn check_validity(&self, catalog: &Catalog) -> AppResult<()> {
        if !catalog.models.contains(&self.model) {
            return Err(FleetError::InvalidExperiment(format!(
                "{} is not a valid model",
                self.model
            )));
        }
        if !catalog.fusions.contains(&self.fusion) {
            return Err(FleetError::InvalidExperiment(format!(
                "{} is not a valid fusion",
                self.fusion
            )));
        }
        if !catalog.datasets.contains(&self.dataset) {
            return Err(FleetError::InvalidExperiment(format!(
                "{} is not a valid dataset",
                self.dataset
            )));
        }
        if !(0.0..=1.0).contains(&self.sample_fraction) {
            return Err(FleetError::InvalidExperiment(format!(
                "{} is not a valid sample-fraction",
                self.sample_fraction
            )));
        }
        if !self.proximal_mu.is_finite() || self.proximal_mu < 0.0 {
            return Err(FleetError::InvalidExperiment(format!(
                "{} is not a valid proximal-mu",
                self.proximal_mu
            )));
        }
        if self.version.is_empty()
            || self.version.contains(DELIMITER)
            || self.version == NONE_TOKEN
        {
            return Err(FleetError::InvalidExperiment(format!(
                "'{}' is not a valid version tag",
                self.version
            )));
        }
        Ok(())
    }

    /// Directory name used for this run's results, locally and on every device.
    pub fn folder_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}_{}_{:?}_{:?}_{}_{}",
            self.version,
            self.model,
            self.fusion,
            self.dataset,
            self.batch_size,
            self.rounds,
            self.epochs,
            self.sample_fraction,
            self.proximal_mu,
            optional_field(self.num_parties),
            optional_field(self.run),
        )
    }
}

pub(crate) fn optional_field(value: Option<u32>) -> String {
    value.map_or_else(|| NONE_TOKEN.to_string(), |v| v.to_string())
}

impl fmt::Display for ExperimentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}/{} bs={} rounds={} epochs={} frac={} mu={} parties={} run={}",
            self.version,
            self.model,
            self.fusion,
            self.dataset,
            self.batch_size,
            self.rounds,
            self.epochs,
            self.sample_fraction,
            self.proximal_mu,
            optional_field(self.num_parties),
            optional_field(self.run),
        )
    }
}

/// A builder for constructing `ExperimentDescriptor` instances.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    inner: ExperimentDescriptor,
}

impl DescriptorBuilder {
    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.inner.batch_size = batch_size;
        self
    }

    /// Set the round count.
    pub fn rounds(mut self, rounds: u32) -> Self {
        self.inner.rounds = rounds;
        self
    }

    /// Set the epochs per round.
    pub fn epochs(mut self, epochs: u32) -> Self {
        self.inner.epochs = epochs;
        self
    }

    /// Set the sampled fraction of parties.
    pub fn sample_fraction(mut self, sample_fraction: f64) -> Self {
        self.inner.sample_fraction = sample_fraction;
        self
    }

    /// Set the proximal term weight.
    pub fn proximal_mu(mut self, proximal_mu: f64) -> Self {
        self.inner.proximal_mu = proximal_mu;
        self
    }

    /// Set or clear the declared party count.
    pub fn num_parties(mut self, num_parties: Option<u32>) -> Self {
        self.inner.num_parties = num_parties;
        self
    }

    /// Set or clear the repetition index.
    pub fn run(mut self, run: Option<u32>) -> Self {
        self.inner.run = run;
        self
    }

    /// Finished descriptor.
    pub fn build(self) -> ExperimentDescriptor {
        self.inner
    }
}
