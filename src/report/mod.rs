//! Per-model metadata records and the aggregate training report.

use crate::convert::{ArtifactFormat, QuantizedArtifact};
use crate::data::DataSource;
use crate::error::{PipelineError, Result};
use crate::features::{feature_group_names, NormalizationParameters};
use crate::model::{FraudModel, ModelKind, ENSEMBLE_NAME};
use crate::training::{BinaryMetrics, ClassificationReport, PrivacyBudget, StopReason, TrainedModel};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MODEL_VERSION: &str = "1.0.0";
pub const FRAMEWORK: &str = "bankguard-trainer";

#[derive(Debug, Clone, Serialize)]
pub struct Preprocessing {
    pub scaler_type: String,
    /// Inputs are standardized with the persisted scaler before scoring.
    pub normalization: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub parameters: usize,
    pub input_shape: [Option<usize>; 2],
    pub output_shape: [Option<usize>; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactInfo {
    pub file: String,
    pub size_bytes: usize,
    pub sha256: String,
    pub format: ArtifactFormat,
}

/// Written next to every edge artifact as `<model>_metadata.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub model_name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub framework: String,
    pub privacy_preserving: bool,
    pub differential_privacy: PrivacyBudget,
    pub input_shape: [Option<usize>; 2],
    pub output_shape: [Option<usize>; 2],
    pub feature_names: Vec<String>,
    pub preprocessing: Preprocessing,
    pub model_info: ModelInfo,
    pub artifact: ArtifactInfo,
}

impl ModelMetadata {
    pub fn new(
        trained: &TrainedModel,
        scaler: &NormalizationParameters,
        artifact: &QuantizedArtifact,
        file: &Path,
        created_at: DateTime<Utc>,
    ) -> Self {
        let model: &FraudModel = &trained.model;
        Self {
            model_name: model.name().to_string(),
            version: MODEL_VERSION.to_string(),
            created_at,
            framework: FRAMEWORK.to_string(),
            privacy_preserving: true,
            differential_privacy: trained.privacy,
            input_shape: model.input_shape(),
            output_shape: model.output_shape(),
            feature_names: feature_group_names(),
            preprocessing: Preprocessing {
                scaler_type: scaler.scaler_type.clone(),
                normalization: true,
            },
            model_info: ModelInfo {
                kind: model.kind(),
                parameters: model.param_count(),
                input_shape: model.input_shape(),
                output_shape: model.output_shape(),
            },
            artifact: ArtifactInfo {
                file: file_name(file),
                size_bytes: artifact.size_bytes,
                sha256: artifact.sha256.clone(),
                format: artifact.format,
            },
        }
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}_metadata.json", self.model_name));
        write_json(&path, self)?;
        Ok(path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).map_err(|e| PipelineError::artifact(path, e))
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub data_source: DataSource,
    pub total_models_trained: usize,
    pub models_failed: usize,
    pub privacy_preserving: bool,
    pub differential_privacy_enabled: bool,
}

/// Training outcome of one model, as recorded in the report.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub parameters: usize,
    pub input_shape: [Option<usize>; 2],
    pub output_shape: [Option<usize>; 2],
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_val_loss: f32,
    pub stop_reason: StopReason,
    pub final_learning_rate: f32,
    pub test_metrics: BinaryMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification_report: Option<ClassificationReport>,
    pub privacy: PrivacyBudget,
}

impl From<&TrainedModel> for ModelSummary {
    fn from(t: &TrainedModel) -> Self {
        Self {
            parameters: t.model.param_count(),
            input_shape: t.model.input_shape(),
            output_shape: t.model.output_shape(),
            epochs_run: t.history.len(),
            best_epoch: t.best_epoch,
            best_val_loss: t.best_val_loss,
            stop_reason: t.stop_reason,
            final_learning_rate: t.history.last().map(|r| r.learning_rate).unwrap_or_default(),
            test_metrics: t.test_metrics.clone(),
            classification_report: t.classification_report.clone(),
            privacy: t.privacy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeModelEntry {
    pub path: PathBuf,
    pub size_bytes: usize,
    pub size_kb: f64,
    pub format: ArtifactFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedModel {
    pub model: String,
    pub reason: String,
}

/// `training_report.json`: every model the run attempted, what it produced, and what
/// failed. `deployment_ready` is false whenever anything failed.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub training_summary: TrainingSummary,
    pub individual_models: BTreeMap<String, ModelSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble_model: Option<ModelSummary>,
    pub edge_models: BTreeMap<String, EdgeModelEntry>,
    pub privacy_parameters: PrivacyBudget,
    pub failed_models: Vec<FailedModel>,
    pub deployment_ready: bool,
}

impl TrainingReport {
    pub fn new(run_id: Uuid, timestamp: DateTime<Utc>, source: DataSource, privacy: PrivacyBudget) -> Self {
        Self {
            training_summary: TrainingSummary {
                timestamp,
                run_id,
                data_source: source,
                total_models_trained: 0,
                models_failed: 0,
                privacy_preserving: true,
                differential_privacy_enabled: true,
            },
            individual_models: BTreeMap::new(),
            ensemble_model: None,
            edge_models: BTreeMap::new(),
            privacy_parameters: privacy,
            failed_models: Vec::new(),
            deployment_ready: false,
        }
    }

    pub fn record_trained(&mut self, trained: &TrainedModel) {
        let summary = ModelSummary::from(trained);
        match trained.model.kind() {
            ModelKind::Individual => {
                self.individual_models.insert(trained.model.name().to_string(), summary);
            }
            ModelKind::Ensemble => self.ensemble_model = Some(summary),
        }
        self.training_summary.total_models_trained += 1;
    }

    pub fn record_failure(&mut self, model: &str, reason: impl ToString) {
        self.failed_models.push(FailedModel {
            model: model.to_string(),
            reason: reason.to_string(),
        });
        self.training_summary.models_failed = self.failed_models.len();
    }

    pub fn record_edge(&mut self, model: &str, path: PathBuf, artifact: &QuantizedArtifact) {
        self.edge_models.insert(
            model.to_string(),
            EdgeModelEntry {
                path,
                size_bytes: artifact.size_bytes,
                size_kb: artifact.size_bytes as f64 / 1024.0,
                format: artifact.format,
            },
        );
    }

    /// Seal the report: ready only when every attempted model trained and converted.
    pub fn finish(&mut self) {
        self.deployment_ready = self.failed_models.is_empty()
            && self.ensemble_model.is_some()
            && self.edge_models.len() == self.training_summary.total_models_trained;
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("training_report.json");
        write_json(&path, self)?;
        Ok(path)
    }

    /// Human-readable run summary for the log.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "run {}: {} trained, {} failed, deployment_ready={}",
            self.training_summary.run_id,
            self.training_summary.total_models_trained,
            self.training_summary.models_failed,
            self.deployment_ready
        )];
        let ensemble = self.ensemble_model.as_ref().map(|m| (ENSEMBLE_NAME, m));
        let trained = self.individual_models.iter().map(|(n, m)| (n.as_str(), m)).chain(ensemble);
        for (name, m) in trained {
            lines.push(format!(
                "{name}: accuracy={:.4} precision={:.4} recall={:.4} params={} epochs={}",
                m.test_metrics.accuracy, m.test_metrics.precision, m.test_metrics.recall, m.parameters, m.epochs_run
            ));
        }
        for (name, e) in &self.edge_models {
            lines.push(format!("{name}: {} ({:.1} KB, {:?})", e.path.display(), e.size_kb, e.format));
        }
        for f in &self.failed_models {
            lines.push(format!("{}: FAILED ({})", f.model, f.reason));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::EdgeConverter;
    use crate::features::{Modality, StandardScaler, FEATURE_DIM};
    use crate::model::build_branch;
    use crate::training::{seeded_rng, EpochRecord};
    use ndarray::Array2;

    fn fixture() -> (TrainedModel, NormalizationParameters, QuantizedArtifact) {
        let mut rng = seeded_rng(61, 0);
        let model = build_branch(Modality::DeviceOrientation, &mut rng);
        let x = Array2::from_shape_fn((20, FEATURE_DIM), |(r, c)| ((r + c) % 5) as f32);
        let (norm, scaler) = StandardScaler::fit_transform(x.view()).unwrap();
        let artifact = EdgeConverter {
            optimize: true,
            quantize: true,
        }
        .convert(&model, Some(norm.view()))
        .unwrap();
        let privacy = PrivacyBudget {
            l2_norm_clip: 0.9,
            noise_multiplier: 1.3,
            num_microbatches: 17,
        };
        let trained = TrainedModel {
            model,
            history: vec![EpochRecord {
                epoch: 1,
                train_loss: 0.6,
                val_loss: 0.5,
                val_accuracy: 0.9,
                learning_rate: 0.001,
            }],
            best_epoch: 1,
            best_val_loss: 0.5,
            stop_reason: StopReason::EpochBudget,
            test_metrics: BinaryMetrics::compute(&[0, 1, 0], &[0, 1, 1]),
            classification_report: None,
            privacy,
        };
        (trained, scaler, artifact)
    }

    #[test]
    fn metadata_carries_privacy_triple_and_measured_size() {
        let (trained, scaler, artifact) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("device_orientation.qmodel");
        let meta = ModelMetadata::new(&trained, &scaler, &artifact, &file, Utc::now());
        let path = meta.write(dir.path()).unwrap();
        assert!(path.ends_with("device_orientation_metadata.json"));

        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["model_name"], "device_orientation");
        assert_eq!(v["version"], MODEL_VERSION);
        assert_eq!(v["differential_privacy"]["num_microbatches"], 17);
        assert_eq!(v["differential_privacy"]["noise_multiplier"].as_f64().unwrap() as f32, 1.3);
        assert_eq!(v["input_shape"], serde_json::json!([null, 8]));
        assert_eq!(v["output_shape"], serde_json::json!([null, 1]));
        assert_eq!(v["feature_names"].as_array().unwrap().len(), 4);
        assert_eq!(v["preprocessing"]["scaler_type"], "StandardScaler");
        assert_eq!(v["preprocessing"]["normalization"], true);
        assert_eq!(v["model_info"]["type"], "individual");
        assert_eq!(v["artifact"]["size_bytes"].as_u64().unwrap() as usize, artifact.bytes.len());
        assert_eq!(v["artifact"]["file"], "device_orientation.qmodel");
    }

    #[test]
    fn failures_block_deployment() {
        let (trained, _, artifact) = fixture();
        let mut report = TrainingReport::new(Uuid::new_v4(), Utc::now(), DataSource::Synthetic, trained.privacy);
        report.record_trained(&trained);
        report.record_edge(trained.model.name(), PathBuf::from("m/device_orientation.qmodel"), &artifact);
        report.record_failure("typing_rhythm", "loss diverged at epoch 3");
        report.finish();
        assert!(!report.deployment_ready);
        assert_eq!(report.training_summary.models_failed, 1);
        assert_eq!(report.training_summary.total_models_trained, 1);
        assert!(report.summary_lines().iter().any(|l| l.contains("typing_rhythm: FAILED")));

        let dir = tempfile::tempdir().unwrap();
        let path = report.write(dir.path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(v["deployment_ready"], false);
        assert!(v.get("ensemble_model").is_none());
        let summary = &v["individual_models"]["device_orientation"];
        assert_eq!(summary["input_shape"], serde_json::json!([null, 8]));
        assert_eq!(summary["output_shape"], serde_json::json!([null, 1]));
        assert_eq!(v["edge_models"]["device_orientation"]["size_bytes"].as_u64().unwrap() as usize, artifact.size_bytes);
    }
}
