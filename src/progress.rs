//! Reindex and upload progress reporting.
//!
//! The batch pipeline and the reindex controller emit [`ProgressEvent`]s
//! through an injected [`ProgressReporter`]. Progress goes to **stderr** so
//! stdout remains parseable for scripts; [`NoProgress`] is the default.

use std::io::Write;
use std::time::Duration;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// The controller picked a strategy for `index`.
    Strategy {
        index: String,
        strategy: String,
        dry_run: bool,
    },
    /// The controller started an execution step (`delete_index`, `upload`, ...).
    Step { index: String, step: String },
    /// A batch group finished. Counts are cumulative over the whole upload;
    /// `group` is the 1-based index of the group that just completed, and
    /// groups may complete out of order.
    Group {
        index: String,
        group: usize,
        group_size: usize,
        succeeded: usize,
        failed: usize,
        elapsed: Duration,
    },
    /// The upload finished or was cancelled.
    Finished {
        index: String,
        succeeded: usize,
        failed: usize,
        elapsed: Duration,
    },
}

/// Receives progress events. Implementations must be cheap and non-blocking.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "upload code-index  group 3  2,500 ok / 0 failed".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = match event {
            ProgressEvent::Strategy {
                index,
                strategy,
                dry_run,
            } => {
                let suffix = if *dry_run { "  (dry run)" } else { "" };
                format!("reindex {}  strategy {}{}\n", index, strategy, suffix)
            }
            ProgressEvent::Step { index, step } => format!("reindex {}  {}...\n", index, step),
            ProgressEvent::Group {
                index,
                group,
                succeeded,
                failed,
                ..
            } => format!(
                "upload {}  group {}  {} ok / {} failed\n",
                index,
                group,
                format_number(*succeeded as u64),
                format_number(*failed as u64)
            ),
            ProgressEvent::Finished {
                index,
                succeeded,
                failed,
                elapsed,
            } => format!(
                "upload {}  done  {} ok / {} failed in {:.1}s\n",
                index,
                format_number(*succeeded as u64),
                format_number(*failed as u64),
                elapsed.as_secs_f64()
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let obj = match event {
            ProgressEvent::Strategy {
                index,
                strategy,
                dry_run,
            } => serde_json::json!({
                "event": "strategy",
                "index": index,
                "strategy": strategy,
                "dry_run": dry_run
            }),
            ProgressEvent::Step { index, step } => serde_json::json!({
                "event": "step",
                "index": index,
                "step": step
            }),
            ProgressEvent::Group {
                index,
                group,
                group_size,
                succeeded,
                failed,
                elapsed,
            } => serde_json::json!({
                "event": "progress",
                "index": index,
                "group": group,
                "group_size": group_size,
                "succeeded": succeeded,
                "failed": failed,
                "elapsed_ms": elapsed.as_millis() as u64
            }),
            ProgressEvent::Finished {
                index,
                succeeded,
                failed,
                elapsed,
            } => serde_json::json!({
                "event": "finished",
                "index": index,
                "succeeded": succeeded,
                "failed": failed,
                "elapsed_ms": elapsed.as_millis() as u64
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

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
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

    pub fn reporter(&self) -> std::sync::Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(2500), "2,500");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
