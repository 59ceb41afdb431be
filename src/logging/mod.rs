//! Structured logging: tracing subscriber setup and standalone JSON event lines.

mod format;

pub use format::{RunSummaryEvent, StructuredLogger};
