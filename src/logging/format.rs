//! Subscriber setup for training logs and the single summary line a run ends with.

use serde::Serialize;
use std::io::Write;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Final line of a run, written outside tracing so it survives any log filter.
#[derive(Serialize)]
pub struct RunSummaryEvent<'a> {
    pub ts: String,
    pub level: &'a str,
    pub target: &'a str,
    pub message: &'a str,
    pub run_id: String,
    pub models_trained: usize,
    pub models_failed: usize,
    pub deployment_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

impl RunSummaryEvent<'_> {
    /// One newline-terminated JSON object.
    pub fn write_line(&self, w: &mut impl Write) -> std::io::Result<()> {
        serde_json::to_writer(&mut *w, self)?;
        w.write_all(b"\n")
    }
}

pub struct StructuredLogger;

impl StructuredLogger {
    /// Training progress goes to stdout, flattened JSON when `json` is set. `RUST_LOG`
    /// overrides `default_level`. False when another subscriber already owns the process.
    pub fn init(json: bool, default_level: &str) -> bool {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let (json_layer, text_layer) = if json {
            let layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_writer(std::io::stdout);
            (Some(layer), None)
        } else {
            (None, Some(fmt::layer().with_writer(std::io::stdout)))
        };
        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(text_layer)
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_event_is_one_json_line() {
        let event = RunSummaryEvent {
            ts: "2024-01-01T00:00:00Z".to_string(),
            level: "INFO",
            target: "bankguard_trainer",
            message: "run complete",
            run_id: "r1".to_string(),
            models_trained: 5,
            models_failed: 0,
            deployment_ready: true,
            report_path: None,
            error: None,
        };
        let mut buf = Vec::new();
        event.write_line(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        let v: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(v["models_trained"], 5);
        assert!(v.get("error").is_none());
    }
}
