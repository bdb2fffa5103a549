//! Experiment identity
//!
//! This module defines what one experiment *is* and how a campaign of them is
//! produced:
//!
//! - **Descriptor**: immutable record of one configuration and repetition index
//! - **Codec**: deterministic flat-string key used by the ledger
//! - **Generator**: expansion of a parameter grid into descriptors
//!
//! # Example
//!
//! ```
//! use energy_fl::experiment::{codec, Catalog, ParameterGrid};
//!
//! let catalog = Catalog::default();
//! let mut grid = ParameterGrid::from_catalog("v0.6", &catalog);
//! grid.rounds_and_epochs = vec![(3, 4)];
//! grid.batch_sizes = vec![16];
//!
//! for descriptor in grid.generate(&catalog).unwrap() {
//!     let key = codec::encode(&descriptor);
//!     assert_eq!(codec::decode(&key).unwrap(), descriptor);
//! }
//! ```

pub mod codec;
pub mod descriptor;
pub mod generator;

pub use codec::{decode, encode, DecodeError};
pub use descriptor::{Catalog, DescriptorBuilder, ExperimentDescriptor};
pub use generator::ParameterGrid;
