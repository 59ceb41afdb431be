//! Error taxonomy: configuration, data, training, and conversion failures.
//! Only `DataError::NotFound` is recoverable (synthetic substitution); the rest abort the run.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("stratified split impossible: {0}")]
    DegenerateSplit(String),
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("data file not found: {0}")]
    NotFound(PathBuf),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed csv {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("schema mismatch: {0}")]
    Schema(String),
    #[error("cannot fit normalization on an empty matrix")]
    Empty,
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("{model}: loss diverged at epoch {epoch}")]
    Diverged { model: String, epoch: usize },
    #[error("{model}: checkpoint write failed: {reason}")]
    Checkpoint { model: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("operator `{op}` has no int8 kernel")]
    UnsupportedOperator { op: &'static str },
    #[error("int8 quantization requested without a representative dataset")]
    MissingCalibration,
    #[error("representative dataset is empty")]
    EmptyCalibration,
    #[error("calibration row has width {got}, model expects {expected}")]
    CalibrationShape { expected: usize, got: usize },
    #[error("non-finite activation range at node {node}")]
    InvalidRange { node: usize },
    #[error("bias of node {node} does not fit the int32 accumulator")]
    BiasOverflow { node: usize },
    #[error("input row has width {got}, model expects {expected}")]
    InputWidth { expected: usize, got: usize },
    #[error("artifact format: {0}")]
    Format(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("artifact io {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn artifact(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Artifact {
            path: path.into(),
            source,
        }
    }
}
