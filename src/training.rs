//! Training coordinator seam.
//!
//! The federated training itself is external. The orchestrator hands it a
//! [`TrainingRequest`] and blocks until it returns; any failure is reported
//! as [`FleetError::Training`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::expand;
use crate::error::{AppResult, FleetError};
use crate::experiment::{descriptor::optional_field, ExperimentDescriptor};

/// Hyperparameters of one training phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    /// Federated rounds
    pub rounds: u32,
    /// Local epochs per round
    pub epochs: u32,
    /// Local batch size
    pub batch_size: u32,
    /// Dataset name
    pub dataset: String,
    /// Aggregation strategy
    pub fusion: String,
    /// Model name
    pub model: String,
    /// Fraction of parties sampled per round
    pub sample_fraction: f64,
    /// Proximal term weight
    pub proximal_mu: f64,
    /// Parties that must join before training starts
    pub min_parties: u32,
    /// Repetition index
    pub run: Option<u32>,
    /// Where the coordinator writes its own results
    pub result_dir: PathBuf,
}

impl TrainingRequest {
    /// Request carrying the hyperparameters of `descriptor`.
    pub fn for_descriptor(
        descriptor: &ExperimentDescriptor,
        min_parties: u32,
        result_dir: PathBuf,
    ) -> Self {
        Self {
            rounds: descriptor.rounds(),
            epochs: descriptor.epochs(),
            batch_size: descriptor.batch_size(),
            dataset: descriptor.dataset().to_string(),
            fusion: descriptor.fusion().to_string(),
            model: descriptor.model().to_string(),
            sample_fraction: descriptor.sample_fraction(),
            proximal_mu: descriptor.proximal_mu(),
            min_parties,
            run: descriptor.run(),
            result_dir,
        }
    }

    fn template_vars(&self, training_port: u16) -> HashMap<String, String> {
        [
            ("rounds", self.rounds.to_string()),
            ("epochs", self.epochs.to_string()),
            ("batch_size", self.batch_size.to_string()),
            ("dataset", self.dataset.clone()),
            ("fusion", self.fusion.clone()),
            ("model", self.model.clone()),
            ("sample_fraction", format!("{:?}", self.sample_fraction)),
            ("proximal_mu", format!("{:?}", self.proximal_mu)),
            ("min_parties", self.min_parties.to_string()),
            ("run", optional_field(self.run)),
            ("result_dir", self.result_dir.display().to_string()),
            ("training_port", training_port.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

#[async_trait]
/// Drives the aggregator side of training.
pub trait TrainingCoordinator: Send + Sync {
    /// Run one full training phase.
    async fn train(&self, request: &TrainingRequest) -> AppResult<()>;
}

/// Runs a configured local command per training phase.
#[derive(Debug, Clone)]
pub struct CommandCoordinator {
    template: String,
    training_port: u16,
}

impl CommandCoordinator {
    /// Coordinator expanding `template` for every request.
    pub fn new(template: &str, training_port: u16) -> Self {
        Self {
            template: template.to_string(),
            training_port,
        }
    }

    /// Command run for `request`.
    pub fn command_line(&self, request: &TrainingRequest) -> AppResult<String> {
        expand(&self.template, &request.template_vars(self.training_port))
    }
}

#[async_trait]
impl TrainingCoordinator for CommandCoordinator {
    async fn train(&self, request: &TrainingRequest) -> AppResult<()> {
        let command = self.command_line(request)?;
        info!("Starting training: {}", command);

        let status = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| FleetError::Training(format!("cannot start '{}': {}", command, e)))?;

        debug!("Training command exited with {}", status);
        if status.success() {
            Ok(())
        } else {
            Err(FleetError::Training(format!(
                "'{}' exited with {}",
                command, status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TrainingRequest {
        let descriptor = ExperimentDescriptor::builder("v0.6", "tf-cnn", "FedProx", "mnist")
            .rounds(3)
            .epochs(4)
            .batch_size(16)
            .proximal_mu(1.0)
            .run(Some(2))
            .build();
        TrainingRequest::for_descriptor(&descriptor, 4, PathBuf::from("results/run"))
    }

    #[test]
    fn command_line_carries_hyperparameters() {
        let coordinator = CommandCoordinator::new(
            "train --rounds {rounds} --mu {proximal_mu} --min {min_parties} --run {run} --out {result_dir}",
            8080,
        );
        assert_eq!(
            coordinator.command_line(&request()).unwrap(),
            "train --rounds 3 --mu 1.0 --min 4 --run 2 --out results/run"
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_training_error() {
        let coordinator = CommandCoordinator::new("exit {rounds}", 8080);
        let err = coordinator.train(&request()).await.unwrap_err();
        assert!(matches!(err, FleetError::Training(_)));
    }

    #[tokio::test]
    async fn zero_exit_succeeds() {
        let coordinator = CommandCoordinator::new("true {dataset}", 8080);
        coordinator.train(&request()).await.unwrap();
    }
}
