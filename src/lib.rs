//! BankGuard trainer: privacy-preserving fraud classifiers for on-device inference.
//!
//! Modular structure:
//! - [`config`] — Training configuration with documented defaults
//! - [`error`] — Configuration, data, training, and conversion errors
//! - [`features`] — 34-wide behavioral feature layout and normalization
//! - [`data`] — CSV loading, synthetic fallback, stratified splitting
//! - [`model`] — Branch classifiers and the multi-branch ensemble
//! - [`training`] — DP-SGD, epoch policies, evaluation
//! - [`convert`] — Graph optimization and int8 edge artifacts
//! - [`report`] — Model metadata and the training report
//! - [`pipeline`] — End-to-end run
//! - [`logging`] — Structured JSON logging

pub mod config;
pub mod convert;
pub mod data;
pub mod error;
pub mod features;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod training;

pub use config::TrainingConfig;
pub use convert::{EdgeConverter, EdgeModel, QuantizedArtifact};
pub use data::Dataset;
pub use error::{PipelineError, Result};
pub use features::{Modality, NormalizationParameters, StandardScaler, FEATURE_DIM};
pub use logging::StructuredLogger;
pub use model::FraudModel;
pub use pipeline::{run, PipelineOutcome};
pub use training::{PrivacyBudget, TrainedModel, Trainer};
