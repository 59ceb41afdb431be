//! Training configuration. Every key is optional; missing keys take the documented defaults.

use crate::error::ConfigError;
use crate::training::PrivacyBudget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Tabular behavioral data (CSV)
    pub data_path: PathBuf,
    /// Directory for edge artifacts, metadata, checkpoints, and the report
    pub model_output_path: PathBuf,
    pub batch_size: usize,
    /// Upper bound on epochs; early stopping may end a run sooner
    pub epochs: usize,
    pub learning_rate: f32,
    pub validation_split: f64,
    pub test_split: f64,
    /// Seed for splitting, shuffling, dropout, noise, and synthetic data
    pub random_state: u64,
    pub dp_l2_norm_clip: f32,
    pub dp_noise_multiplier: f32,
    pub dp_num_microbatches: usize,
    /// Graph optimization (dropout stripping, normalization folding)
    pub tflite_optimization: bool,
    /// Full-integer int8 conversion with calibration
    pub quantization: bool,
    /// Rows generated when `data_path` does not exist
    pub synthetic_samples: usize,
    pub synthetic_fraud_rate: f64,
    /// Upper bound on representative rows used for range calibration
    pub calibration_samples: usize,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/behavioral_data.csv"),
            model_output_path: PathBuf::from("models/"),
            batch_size: 32,
            epochs: 100,
            learning_rate: 0.001,
            validation_split: 0.2,
            test_split: 0.1,
            random_state: 42,
            dp_l2_norm_clip: 1.0,
            dp_noise_multiplier: 1.1,
            dp_num_microbatches: 250,
            tflite_optimization: true,
            quantization: true,
            synthetic_samples: 10_000,
            synthetic_fraud_rate: 0.05,
            calibration_samples: 100,
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl TrainingConfig {
    /// Load from JSON if the file exists; a missing file yields defaults.
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                key,
                reason: reason.into(),
            }
        }

        if !(self.validation_split > 0.0) {
            return Err(invalid("validation_split", "must be > 0"));
        }
        if !(self.test_split > 0.0) {
            return Err(invalid("test_split", "must be > 0"));
        }
        if self.validation_split + self.test_split >= 1.0 {
            return Err(invalid(
                "test_split",
                format!(
                    "validation_split + test_split = {} must be < 1.0",
                    self.validation_split + self.test_split
                ),
            ));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }
        if self.epochs == 0 {
            return Err(invalid("epochs", "must be > 0"));
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(invalid("learning_rate", "must be a positive number"));
        }
        if !(self.dp_l2_norm_clip > 0.0) || !self.dp_l2_norm_clip.is_finite() {
            return Err(invalid("dp_l2_norm_clip", "must be a positive number"));
        }
        if !(self.dp_noise_multiplier >= 0.0) || !self.dp_noise_multiplier.is_finite() {
            return Err(invalid("dp_noise_multiplier", "must be >= 0"));
        }
        if self.dp_num_microbatches == 0 {
            return Err(invalid("dp_num_microbatches", "must be > 0"));
        }
        if self.quantization && self.calibration_samples == 0 {
            return Err(invalid(
                "calibration_samples",
                "quantization needs at least one representative sample",
            ));
        }
        if !(0.0..1.0).contains(&self.synthetic_fraud_rate) {
            return Err(invalid("synthetic_fraud_rate", "must be in [0, 1)"));
        }
        Ok(())
    }

    /// The privacy triple exactly as configured.
    pub fn privacy(&self) -> PrivacyBudget {
        PrivacyBudget {
            l2_norm_clip: self.dp_l2_norm_clip,
            noise_multiplier: self.dp_noise_multiplier,
            num_microbatches: self.dp_num_microbatches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_takes_defaults_for_missing_keys() {
        let c: TrainingConfig = serde_json::from_str(r#"{"epochs": 7, "quantization": false}"#).unwrap();
        assert_eq!(c.epochs, 7);
        assert!(!c.quantization);
        assert_eq!(c.batch_size, 32);
        assert_eq!(c.dp_num_microbatches, 250);
        assert!((c.dp_noise_multiplier - 1.1).abs() < 1e-6);
        assert!((c.validation_split - 0.2).abs() < 1e-12);
    }

    #[test]
    fn missing_file_is_default() {
        let c = TrainingConfig::load(Path::new("does/not/exist.json")).unwrap();
        assert_eq!(c.random_state, 42);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            TrainingConfig::load(&path),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn split_sum_must_stay_below_one() {
        let c = TrainingConfig {
            validation_split: 0.6,
            test_split: 0.4,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid { key: "test_split", .. })));
    }

    #[test]
    fn privacy_triple_is_verbatim() {
        let c = TrainingConfig {
            dp_l2_norm_clip: 0.7,
            dp_noise_multiplier: 2.3,
            dp_num_microbatches: 13,
            ..Default::default()
        };
        let p = c.privacy();
        assert_eq!(p.l2_norm_clip, 0.7);
        assert_eq!(p.noise_multiplier, 2.3);
        assert_eq!(p.num_microbatches, 13);
    }
}
