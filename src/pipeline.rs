//! End-to-end run: data → normalization → split → DP training of four branches and
//! the ensemble → edge conversion → metadata and report.
//!
//! Every stage takes what it needs from a [`RunContext`] and returns its products;
//! nothing accumulates on shared mutable state.

use crate::config::TrainingConfig;
use crate::convert::{EdgeConverter, QuantizedArtifact};
use crate::data::{load_or_synthesize, stratified_split, DataSource, Dataset};
use crate::error::{PipelineError, Result, TrainingError};
use crate::features::{Modality, NormalizationParameters, StandardScaler};
use crate::model::{build_branch, build_ensemble, ENSEMBLE_NAME};
use crate::report::{ModelMetadata, TrainingReport};
use crate::training::{seeded_rng, PartitionedData, TrainedModel, Trainer, TrainingSchedule};
use chrono::{DateTime, Utc};
use ndarray::s;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const SCALER_FILE: &str = "scalers.json";
pub const CHECKPOINT_FILE: &str = "ensemble_best.json";
pub const ARTIFACT_EXTENSION: &str = "qmodel";

/// Random streams: training draws from `1..=5`, weight initialization from `101..=105`.
const ENSEMBLE_STREAM: u64 = 5;
const INIT_STREAM_OFFSET: u64 = 100;

fn branch_stream(modality: Modality) -> u64 {
    modality.index() as u64 + 1
}

/// Run-scoped state, frozen once data is prepared.
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub config: TrainingConfig,
    pub source: DataSource,
    pub scaler: NormalizationParameters,
    pub data: PartitionedData,
}

pub struct PipelineOutcome {
    pub report: TrainingReport,
    pub report_path: PathBuf,
    pub artifacts: Vec<PathBuf>,
    pub models: Vec<TrainedModel>,
}

pub fn run(config: TrainingConfig) -> Result<PipelineOutcome> {
    config.validate()?;
    let ctx = prepare(config)?;
    let (models, failures) = train_all(&ctx)?;
    export(&ctx, models, failures)
}

/// Load (or synthesize) data, fit and persist normalization, split once.
pub fn prepare(config: TrainingConfig) -> Result<RunContext> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let out = &config.model_output_path;
    std::fs::create_dir_all(out).map_err(|e| PipelineError::artifact(out, e))?;
    info!(%run_id, output = %out.display(), "training run started");

    let (raw, source) = load_or_synthesize(&config)?;
    info!(
        rows = raw.len(),
        fraud_rate = raw.fraud_rate(),
        source = ?source,
        "dataset ready"
    );

    let (features, scaler) = StandardScaler::fit_transform(raw.features.view())?;
    scaler.save(&out.join(SCALER_FILE))?;
    let normalized = Dataset {
        features,
        labels: raw.labels,
    };

    let labels = normalized.labels.to_vec();
    let split = stratified_split(&labels, config.validation_split, config.test_split, config.random_state)?;
    let data = PartitionedData::from_split(&normalized, &split);
    info!(
        train = data.train.len(),
        validation = data.validation.len(),
        test = data.test.len(),
        "stratified split"
    );

    Ok(RunContext {
        run_id,
        started_at,
        config,
        source,
        scaler,
        data,
    })
}

type Failures = Vec<(String, TrainingError)>;

/// Train the four branches in parallel, then the ensemble. Divergence is recorded as a
/// failure of that model; checkpoint I/O failures abort the run.
pub fn train_all(ctx: &RunContext) -> Result<(Vec<TrainedModel>, Failures)> {
    let trainer = Trainer::new(&ctx.config);
    let seed = ctx.config.random_state;

    let branch_results: Vec<(Modality, std::result::Result<TrainedModel, TrainingError>)> = Modality::ALL
        .par_iter()
        .map(|&m| {
            let stream = branch_stream(m);
            let mut init = seeded_rng(seed, INIT_STREAM_OFFSET + stream);
            let compiled = trainer.compile(build_branch(m, &mut init));
            (m, trainer.fit(compiled, &ctx.data, &TrainingSchedule::branch(), stream))
        })
        .collect();

    let mut models = Vec::with_capacity(Modality::ALL.len() + 1);
    let mut failures = Vec::new();
    for (m, result) in branch_results {
        collect(m.as_str(), result, &mut models, &mut failures)?;
    }

    let mut init = seeded_rng(seed, INIT_STREAM_OFFSET + ENSEMBLE_STREAM);
    let compiled = trainer.compile(build_ensemble(&mut init));
    let schedule = TrainingSchedule::ensemble(ctx.config.model_output_path.join(CHECKPOINT_FILE));
    let result = trainer.fit(compiled, &ctx.data, &schedule, ENSEMBLE_STREAM);
    collect(ENSEMBLE_NAME, result, &mut models, &mut failures)?;

    Ok((models, failures))
}

fn collect(
    name: &str,
    result: std::result::Result<TrainedModel, TrainingError>,
    models: &mut Vec<TrainedModel>,
    failures: &mut Failures,
) -> Result<()> {
    match result {
        Ok(t) => models.push(t),
        Err(e @ TrainingError::Diverged { .. }) => {
            error!(model = name, error = %e, "training failed");
            failures.push((name.to_string(), e));
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Convert every trained model, write artifacts, metadata, and the aggregate report.
pub fn export(ctx: &RunContext, models: Vec<TrainedModel>, failures: Failures) -> Result<PipelineOutcome> {
    let out = &ctx.config.model_output_path;
    let converter = EdgeConverter::from_config(&ctx.config);
    let train = &ctx.data.train.features;
    let n_cal = ctx.config.calibration_samples.min(train.nrows());
    let calibration = train.slice(s![..n_cal, ..]);

    let mut report = TrainingReport::new(ctx.run_id, ctx.started_at, ctx.source, ctx.config.privacy());
    for (name, e) in &failures {
        report.record_failure(name, e);
    }

    let mut artifacts = Vec::with_capacity(models.len());
    for trained in &models {
        report.record_trained(trained);
        let artifact = converter.convert(&trained.model, Some(calibration))?;
        let path = write_artifact(out, trained.model.name(), &artifact)?;
        let metadata = ModelMetadata::new(trained, &ctx.scaler, &artifact, &path, Utc::now());
        metadata.write(out)?;
        report.record_edge(trained.model.name(), path.clone(), &artifact);
        artifacts.push(path);
    }

    report.finish();
    let report_path = report.write(out)?;
    for line in report.summary_lines() {
        info!("{line}");
    }
    if !report.deployment_ready {
        warn!(failed = report.failed_models.len(), "run finished with failures; not deployment ready");
    }

    Ok(PipelineOutcome {
        report,
        report_path,
        artifacts,
        models,
    })
}

fn write_artifact(dir: &Path, name: &str, artifact: &QuantizedArtifact) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.{ARTIFACT_EXTENSION}"));
    std::fs::write(&path, &artifact.bytes).map_err(|e| PipelineError::artifact(&path, e))?;
    info!(
        model = name,
        path = %path.display(),
        size_kb = artifact.size_bytes as f64 / 1024.0,
        sha256 = %artifact.sha256,
        "edge model saved"
    );
    Ok(path)
}
