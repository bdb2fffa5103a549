//! Parameter-grid expansion.
//!
//! A campaign is declared as a [`ParameterGrid`]; [`ParameterGrid::generate`]
//! enumerates it into descriptors in a fixed nesting order
//! (dataset → model → fusion → proximal-mu → rounds/epochs → batch size → run),
//! so that resuming a campaign visits experiments in the same order.

use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::experiment::descriptor::{Catalog, ExperimentDescriptor};

/// Declarative description of a campaign's sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    /// Version tag stamped on every generated descriptor
    pub version: String,
    /// Datasets to sweep
    pub datasets: Vec<String>,
    /// Models to sweep
    pub models: Vec<String>,
    /// Fusion algorithms to sweep
    pub fusions: Vec<String>,
    /// (rounds, epochs) pairs
    pub rounds_and_epochs: Vec<(u32, u32)>,
    /// Batch sizes to sweep
    pub batch_sizes: Vec<u32>,
    /// Repetitions of each configuration (run indices are 1-based)
    pub runs: u32,
    /// Number of participating parties recorded on each descriptor
    pub num_parties: Option<u32>,
    /// Client sampling fraction
    #[serde(default = "default_sample_fraction")]
    pub sample_fraction: f64,
}

fn default_sample_fraction() -> f64 {
    1.0
}

impl ParameterGrid {
    /// A grid sweeping every identifier known to `catalog`.
    pub fn from_catalog(version: &str, catalog: &Catalog) -> Self {
        Self {
            version: version.to_string(),
            datasets: catalog.datasets.clone(),
            models: catalog.models.clone(),
            fusions: catalog.fusions.clone(),
            rounds_and_epochs: Vec::new(),
            batch_sizes: Vec::new(),
            runs: 1,
            num_parties: None,
            sample_fraction: default_sample_fraction(),
        }
    }

    /// Enumerate the grid. Proximal fusions are expanded over the catalog's
    /// proximal-mu values; all other fusions use mu = 0. Every descriptor is
    /// validated against `catalog`.
    pub fn generate(&self, catalog: &Catalog) -> AppResult<Vec<ExperimentDescriptor>> {
        let mut experiments = Vec::new();
        for dataset in &self.datasets {
            for model in &self.models {
                for fusion in &self.fusions {
                    let mus: &[f64] = if catalog.is_proximal(fusion) {
                        &catalog.proximal_mus
                    } else {
                        &[0.0]
                    };
                    for &mu in mus {
                        for &(rounds, epochs) in &self.rounds_and_epochs {
                            for &batch_size in &self.batch_sizes {
                                for run in 1..=self.runs {
                                    let descriptor = ExperimentDescriptor::builder(
                                        &self.version,
                                        model,
                                        fusion,
                                        dataset,
                                    )
                                    .batch_size(batch_size)
                                    .rounds(rounds)
                                    .epochs(epochs)
                                    .sample_fraction(self.sample_fraction)
                                    .proximal_mu(mu)
                                    .num_parties(self.num_parties)
                                    .run(Some(run))
                                    .build();
                                    descriptor.check_validity(catalog)?;
                                    experiments.push(descriptor);
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(experiments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::codec;

    fn single_config_grid() -> ParameterGrid {
        ParameterGrid {
            version: "v0.6".to_string(),
            datasets: vec!["mnist".to_string()],
            models: vec!["tf-cnn".to_string()],
            fusions: vec!["FedAvg".to_string()],
            rounds_and_epochs: vec![(3, 4)],
            batch_sizes: vec![16, 512],
            runs: 3,
            num_parties: Some(4),
            sample_fraction: 1.0,
        }
    }

    #[test]
    fn grid_varies_only_batch_size_and_run() {
        let experiments = single_config_grid().generate(&Catalog::default()).unwrap();
        assert_eq!(experiments.len(), 6);

        for e in &experiments {
            assert_eq!(e.rounds(), 3);
            assert_eq!(e.epochs(), 4);
            assert_eq!(e.num_parties(), Some(4));
            assert_eq!(e.dataset(), "mnist");
        }

        let combos: Vec<(u32, Option<u32>)> =
            experiments.iter().map(|e| (e.batch_size(), e.run())).collect();
        assert_eq!(
            combos,
            vec![
                (16, Some(1)),
                (16, Some(2)),
                (16, Some(3)),
                (512, Some(1)),
                (512, Some(2)),
                (512, Some(3)),
            ]
        );
    }

    #[test]
    fn proximal_fusion_expands_over_mus() {
        let mut catalog = Catalog::default();
        catalog.proximal_mus = vec![0.5, 1.0];
        let mut grid = single_config_grid();
        grid.fusions = vec!["FedAvg".to_string(), "FedProx".to_string()];

        let experiments = grid.generate(&catalog).unwrap();
        assert_eq!(experiments.len(), 6 + 12);
        assert!(experiments
            .iter()
            .filter(|e| e.fusion() == "FedAvg")
            .all(|e| e.proximal_mu() == 0.0));
        assert!(experiments
            .iter()
            .filter(|e| e.fusion() == "FedProx")
            .all(|e| e.proximal_mu() > 0.0));
    }

    #[test]
    fn every_generated_descriptor_round_trips() {
        let catalog = Catalog::default();
        let mut grid = ParameterGrid::from_catalog("v0.6", &catalog);
        grid.rounds_and_epochs = vec![(2, 2), (3, 4)];
        grid.batch_sizes = vec![16, 512];
        grid.runs = 3;
        grid.num_parties = Some(4);

        let experiments = grid.generate(&catalog).unwrap();
        assert!(!experiments.is_empty());
        for e in &experiments {
            assert_eq!(&codec::decode(&codec::encode(e)).unwrap(), e);
        }
    }

    #[test]
    fn unknown_dataset_fails_generation() {
        let mut grid = single_config_grid();
        grid.datasets.push("imagenet".to_string());
        assert!(grid.generate(&Catalog::default()).is_err());
    }
}
