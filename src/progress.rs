//! Update progress reporting.
//!
//! Reports what `rix update` is doing (scanning, diffing, how many chunks are
//! left to embed, persisting) so users see when the index is up to date.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for an index update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateProgressEvent {
    /// Walking the file tree. Total unknown.
    Scanning,
    /// Manifest diff computed.
    Diffing {
        added: usize,
        modified: usize,
        removed: usize,
    },
    /// `done` of `total` uncached chunks embedded.
    Embedding { done: usize, total: usize },
    /// Writing the next snapshot.
    Persisting,
}

/// Reports update progress. Implementations write to stderr (human or JSON).
pub trait UpdateProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the coordinator.
    fn report(&self, event: UpdateProgressEvent);
}

/// Human-friendly progress on stderr: "update  embedding  1,234 / 5,000 chunks".
pub struct StderrProgress;

impl UpdateProgressReporter for StderrProgress {
    fn report(&self, event: UpdateProgressEvent) {
        let line = match &event {
            UpdateProgressEvent::Scanning => "update  scanning...\n".to_string(),
            UpdateProgressEvent::Diffing {
                added,
                modified,
                removed,
            } => format!(
                "update  diff  +{} ~{} -{} files\n",
                format_number(*added as u64),
                format_number(*modified as u64),
                format_number(*removed as u64)
            ),
            UpdateProgressEvent::Embedding { done, total } => format!(
                "update  embedding  {} / {} chunks\n",
                format_number(*done as u64),
                format_number(*total as u64)
            ),
            UpdateProgressEvent::Persisting => "update  persisting snapshot\n".to_string(),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl UpdateProgressReporter for JsonProgress {
    fn report(&self, event: UpdateProgressEvent) {
        let obj = match &event {
            UpdateProgressEvent::Scanning => serde_json::json!({
                "event": "progress",
                "phase": "scanning"
            }),
            UpdateProgressEvent::Diffing {
                added,
                modified,
                removed,
            } => serde_json::json!({
                "event": "progress",
                "phase": "diffing",
                "added": added,
                "modified": modified,
                "removed": removed
            }),
            UpdateProgressEvent::Embedding { done, total } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "n": done,
                "total": total
            }),
            UpdateProgressEvent::Persisting => serde_json::json!({
                "event": "progress",
                "phase": "persisting"
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl UpdateProgressReporter for NoProgress {
    fn report(&self, _event: UpdateProgressEvent) {}
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
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn UpdateProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
