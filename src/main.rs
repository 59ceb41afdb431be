//! BankGuard trainer entrypoint: trains the four branch models and the ensemble under
//! differential privacy, then writes edge artifacts, metadata, and the training report.

use bankguard_trainer::{logging::RunSummaryEvent, pipeline, StructuredLogger, TrainingConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

fn emit_summary(
    run_id: String,
    models_trained: usize,
    models_failed: usize,
    deployment_ready: bool,
    report_path: Option<String>,
    error: Option<&str>,
) {
    let event = RunSummaryEvent {
        ts: chrono::Utc::now().to_rfc3339(),
        level: if error.is_some() { "ERROR" } else { "INFO" },
        target: "bankguard_trainer",
        message: "training run finished",
        run_id,
        models_trained,
        models_failed,
        deployment_ready,
        report_path,
        error,
    };
    if let Err(e) = event.write_line(&mut std::io::stdout().lock()) {
        error!(error = %e, "cannot write run summary");
    }
}

fn main() -> ExitCode {
    let config_path = std::env::var("BANKGUARD_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/training_config.json"));
    // Logging is configured by the file itself, so parse before the subscriber exists.
    let loaded = TrainingConfig::load(&config_path);
    let (json, level) = match &loaded {
        Ok(c) => (c.log.json, c.log.level.clone()),
        Err(_) => (true, "info".to_string()),
    };
    StructuredLogger::init(json, &level);

    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    info!(config = %config_path.display(), output = %config.model_output_path.display(), "bankguard trainer starting");

    match pipeline::run(config) {
        Ok(outcome) => {
            let s = &outcome.report.training_summary;
            emit_summary(
                s.run_id.to_string(),
                s.total_models_trained,
                s.models_failed,
                outcome.report.deployment_ready,
                Some(outcome.report_path.display().to_string()),
                None,
            );
            if outcome.report.deployment_ready {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(e) => {
            error!(error = %e, "training run aborted");
            emit_summary(String::new(), 0, 0, false, None, Some(&e.to_string()));
            ExitCode::FAILURE
        }
    }
}
