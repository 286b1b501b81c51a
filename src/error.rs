// Error types shared by the loader, the trainers, the cache and the config layer.

use std::path::PathBuf;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Problems with the dataset directory. Always fatal at load time.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("missing dataset file: {0}")]
    MissingFile(PathBuf),

    #[error("failed to read {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path}: row {row}, column {column}: cannot parse {value:?} as a number")]
    Parse {
        path: PathBuf,
        row: usize,
        column: usize,
        value: String,
    },

    #[error("{path}: row {row} has {found} columns, expected {expected}")]
    RaggedRow {
        path: PathBuf,
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("row count mismatch: {what} has {found} rows, expected {expected}")]
    RowCount {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("cell id mismatch at row {row}: {left:?} vs {right:?}")]
    CellIdMismatch {
        row: usize,
        left: String,
        right: String,
    },

    #[error("dataset is empty: {0}")]
    Empty(&'static str),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// A single model fit went wrong. Recovered per fold by the harness.
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("training diverged at epoch {epoch}: loss = {loss}")]
    Diverged { epoch: usize, loss: f32 },

    #[error("no training rows left after carving the validation slice")]
    EmptyTrainingSet,

    #[error("invalid hyperparameter {name} = {value}: {constraint}")]
    InvalidHyperparameter {
        name: &'static str,
        value: String,
        constraint: &'static str,
    },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    #[error("linear system is singular")]
    Singular,

    #[error("pre-training needs a cell-type label for every training row")]
    MissingLabels,
}

/// Results cache could not be read or written.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_pickle::Error,
    },
}

/// Experiment configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Crate-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Fit(#[from] FitError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plotting failed: {0}")]
    Plot(String),
}
