//! Ingest progress reporting.
//!
//! Reports what `repoctx ingest` is doing so users see how much is left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::{IsTerminal, Write};
use std::sync::Arc;

/// A single progress event for one ingest run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestProgressEvent {
    /// The crawler is walking the repository. Total unknown.
    Discovering { root: String },
    /// `n` of `total` changed artifacts have been written to the stores.
    Ingesting { n: u64, total: u64 },
    /// Chunks of `count` artifacts no longer in the repository are being removed.
    Removing { count: u64 },
}

/// Receives progress events from the ingest pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest  1,234 / 5,000 artifacts".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Discovering { root } => {
                format!("ingest {}  discovering...\n", root)
            }
            IngestProgressEvent::Ingesting { n, total } => format!(
                "ingest  {} / {} artifacts\n",
                format_number(*n),
                format_number(*total)
            ),
            IngestProgressEvent::Removing { count } => {
                format!("ingest  removing {} deleted artifacts\n", format_number(*count))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Discovering { root } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "root": root,
            }),
            IngestProgressEvent::Ingesting { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "ingesting",
                "n": n,
                "total": total,
            }),
            IngestProgressEvent::Removing { count } => serde_json::json!({
                "event": "progress",
                "phase": "removing",
                "count": count,
            }),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", obj);
        let _ = stderr.flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
