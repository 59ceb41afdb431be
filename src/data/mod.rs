//! Labeled behavioral datasets: CSV loading, synthetic fallback, stratified splitting.

mod loader;
mod split;
mod synthetic;

pub use loader::{load_csv, RESERVED_COLUMNS};
pub use split::{stratified_split, SplitIndices};
pub use synthetic::SyntheticGenerator;

use crate::config::TrainingConfig;
use crate::error::DataError;
use ndarray::{Array1, Array2, Axis};

/// Raw feature matrix (N × 34) with binary labels (0 = legitimate, 1 = fraud).
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Array2<f32>,
    pub labels: Array1<u8>,
}

/// Where the rows came from; recorded in the training report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    File,
    Synthetic,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn fraud_rate(&self) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        self.labels.iter().filter(|&&l| l == 1).count() as f64 / self.labels.len() as f64
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Dataset {
        Dataset {
            features: self.features.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
        }
    }
}

/// Load the configured CSV; only a missing file falls back to synthetic data.
pub fn load_or_synthesize(config: &TrainingConfig) -> Result<(Dataset, DataSource), DataError> {
    match load_csv(&config.data_path) {
        Ok(ds) => {
            tracing::info!(
                path = %config.data_path.display(),
                samples = ds.len(),
                fraud_rate = ds.fraud_rate(),
                "loaded behavioral data"
            );
            Ok((ds, DataSource::File))
        }
        Err(DataError::NotFound(path)) => {
            tracing::warn!(path = %path.display(), "data file not found, generating synthetic data");
            let ds = SyntheticGenerator::new(config.synthetic_samples, config.synthetic_fraud_rate)
                .generate(config.random_state);
            tracing::info!(samples = ds.len(), fraud_rate = ds.fraud_rate(), "generated synthetic data");
            Ok((ds, DataSource::Synthetic))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_synthetic() {
        let config = TrainingConfig {
            data_path: "no/such/file.csv".into(),
            synthetic_samples: 200,
            ..Default::default()
        };
        let (ds, src) = load_or_synthesize(&config).unwrap();
        assert_eq!(src, DataSource::Synthetic);
        assert_eq!(ds.len(), 200);
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "user_id,is_fraud,f0\nu1,1,not-a-number\n").unwrap();
        let config = TrainingConfig {
            data_path: path,
            ..Default::default()
        };
        assert!(matches!(load_or_synthesize(&config), Err(DataError::Schema(_))));
    }
}
