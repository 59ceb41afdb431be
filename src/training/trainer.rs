//! Epoch loop: DP-SGD updates, validation, early stopping, learning-rate decay,
//! best-weight checkpointing, and held-out evaluation.

use super::dp::{binary_cross_entropy, CompiledModel, DpSgd};
use super::metrics::{BinaryMetrics, ClassificationReport};
use super::policy::{EarlyStopping, ReduceLrOnPlateau, TrainingSchedule};
use super::{seeded_rng, PrivacyBudget};
use crate::config::TrainingConfig;
use crate::data::{Dataset, SplitIndices};
use crate::error::TrainingError;
use crate::model::{FraudModel, ModelKind};
use ndarray::{Array1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

const DECISION_THRESHOLD: f32 = 0.5;

/// Normalized train / validation / test partitions (full 34-wide rows).
#[derive(Debug, Clone)]
pub struct PartitionedData {
    pub train: Dataset,
    pub validation: Dataset,
    pub test: Dataset,
}

impl PartitionedData {
    pub fn from_split(data: &Dataset, split: &SplitIndices) -> Self {
        Self {
            train: data.select(&split.train),
            validation: data.select(&split.validation),
            test: data.select(&split.test),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub val_accuracy: f64,
    pub learning_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EpochBudget,
    EarlyStopped,
}

/// A trained model with its history, held-out diagnostics, and the privacy triple it
/// was trained under.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub model: FraudModel,
    pub history: Vec<EpochRecord>,
    pub best_epoch: usize,
    pub best_val_loss: f32,
    pub stop_reason: StopReason,
    pub test_metrics: BinaryMetrics,
    pub classification_report: Option<ClassificationReport>,
    pub privacy: PrivacyBudget,
}

pub struct Trainer {
    privacy: PrivacyBudget,
    learning_rate: f32,
    batch_size: usize,
    epochs: usize,
    seed: u64,
}

impl Trainer {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            privacy: config.privacy(),
            learning_rate: config.learning_rate,
            batch_size: config.batch_size,
            epochs: config.epochs,
            seed: config.random_state,
        }
    }

    pub fn compile(&self, model: FraudModel) -> CompiledModel {
        DpSgd::new(self.privacy, self.learning_rate).compile(model)
    }

    /// Train `compiled` on `data`. `stream` selects an independent random stream so
    /// parallel runs stay reproducible.
    pub fn fit(
        &self,
        compiled: CompiledModel,
        data: &PartitionedData,
        schedule: &TrainingSchedule,
        stream: u64,
    ) -> Result<TrainedModel, TrainingError> {
        let CompiledModel {
            mut model,
            mut optimizer,
        } = compiled;
        let name = model.name().to_string();
        let mut rng = seeded_rng(self.seed, stream);

        let x_train = model.select_input(data.train.features.view()).to_owned();
        let y_train = data.train.labels.mapv(f32::from);
        let x_val = model.select_input(data.validation.features.view()).to_owned();
        let y_val = data.validation.labels.mapv(f32::from);
        let val_labels = data.validation.labels.to_vec();

        let mut early = EarlyStopping::new(schedule.early_stopping_patience);
        let mut plateau = ReduceLrOnPlateau::new(schedule.lr_patience, schedule.lr_factor);
        let mut best: Option<FraudModel> = None;
        let mut history = Vec::with_capacity(self.epochs);
        let mut stop_reason = StopReason::EpochBudget;
        let mut order: Vec<usize> = (0..x_train.nrows()).collect();

        info!(
            model = %name,
            params = model.param_count(),
            train = x_train.nrows(),
            validation = x_val.nrows(),
            "training started"
        );

        for epoch in 1..=self.epochs {
            order.shuffle(&mut rng);
            let mut loss_sum = 0.0f64;
            for batch in order.chunks(self.batch_size) {
                let xb = x_train.select(Axis(0), batch);
                let yb = y_train.select(Axis(0), batch);
                let loss = optimizer.step(&mut model, xb.view(), yb.view(), &mut rng);
                loss_sum += f64::from(loss) * batch.len() as f64;
            }
            let train_loss = (loss_sum / order.len().max(1) as f64) as f32;

            let val_p = model.predict(x_val.view());
            let val_loss = binary_cross_entropy(val_p.view(), y_val.view());
            if !train_loss.is_finite() || !val_loss.is_finite() {
                return Err(TrainingError::Diverged { model: name, epoch });
            }
            let val_accuracy = BinaryMetrics::compute(&threshold(&val_p), &val_labels).accuracy;

            let lr = optimizer.learning_rate();
            history.push(EpochRecord {
                epoch,
                train_loss,
                val_loss,
                val_accuracy,
                learning_rate: lr,
            });
            debug!(model = %name, epoch, train_loss, val_loss, val_accuracy, lr, "epoch");

            let obs = early.observe(epoch, val_loss);
            if obs.improved {
                if let Some(path) = &schedule.checkpoint {
                    write_checkpoint(&model, path)?;
                }
                best = Some(model.clone());
            }
            if let Some(next) = plateau.observe(val_loss, lr) {
                info!(model = %name, epoch, from = lr, to = next, "reducing learning rate");
                optimizer.set_learning_rate(next);
            }
            if obs.stop {
                info!(model = %name, epoch, best_epoch = early.best_epoch(), "early stopping");
                stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        if schedule.restore_best {
            if let Some(b) = best {
                model = b;
            }
        }

        let (test_metrics, classification_report) = evaluate(&model, &data.test);
        info!(
            model = %name,
            accuracy = test_metrics.accuracy,
            precision = test_metrics.precision,
            recall = test_metrics.recall,
            "test evaluation"
        );
        if let Some(report) = &classification_report {
            info!(model = %name, "classification report:\n{report}");
        }

        Ok(TrainedModel {
            model,
            history,
            best_epoch: early.best_epoch(),
            best_val_loss: early.best(),
            stop_reason,
            test_metrics,
            classification_report,
            privacy: optimizer.budget(),
        })
    }
}

fn threshold(p: &Array1<f32>) -> Vec<u8> {
    p.iter().map(|&v| u8::from(v > DECISION_THRESHOLD)).collect()
}

/// Held-out metrics; the ensemble additionally gets a per-class report.
pub fn evaluate(model: &FraudModel, test: &Dataset) -> (BinaryMetrics, Option<ClassificationReport>) {
    let x: ArrayView2<'_, f32> = model.select_input(test.features.view());
    let preds = threshold(&model.predict(x));
    let labels = test.labels.to_vec();
    let metrics = BinaryMetrics::compute(&preds, &labels);
    let report = (model.kind() == ModelKind::Ensemble).then(|| ClassificationReport::from_metrics(&metrics));
    (metrics, report)
}

fn write_checkpoint(model: &FraudModel, path: &Path) -> Result<(), TrainingError> {
    let fail = |reason: String| TrainingError::Checkpoint {
        model: model.name().to_string(),
        reason,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| fail(e.to_string()))?;
    }
    let bytes = serde_json::to_vec(model).map_err(|e| fail(e.to_string()))?;
    std::fs::write(path, bytes).map_err(|e| fail(e.to_string()))?;
    debug!(model = model.name(), path = %path.display(), "checkpoint written");
    Ok(())
}
