// Predict electrophysiological properties of neurons from single-cell gene
// expression with a sparse bottleneck network, compare it against penalized
// linear baselines under repeated cross-validation, and look at the learned
// low-dimensional code.

pub mod bottleneck;
pub mod cache;
pub mod config;
pub mod cv;
pub mod data;
pub mod error;
pub mod latent;
pub mod linear;
pub mod metrics;
pub mod preprocessing;

pub use config::ExperimentConfig;
pub use cv::{CrossValidation, ResultsTable};
pub use data::{Dataset, SyntheticSpec};
pub use error::{Error, Result};
