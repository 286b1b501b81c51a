// Sparse bottleneck network: encoder, narrow linear bottleneck, decoder and
// a regression head, with group-lasso selection of input genes.

pub mod activation;
pub mod architecture;
pub mod loss;
pub mod model;
pub mod network;
pub mod optim;
pub mod trainer;

pub use activation::Activation;
pub use architecture::{Architecture, ArchitectureBuilder, Head, LayerRole, LayerSpec};
pub use model::{BottleneckConfig, BottleneckFitter, BottleneckParams, FittedBottleneck, Schedule, TrainingRows};
pub use network::{Network, Regularization};
pub use trainer::{FitReport, TrainConfig, TrainingHistory};
