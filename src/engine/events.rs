//! Structured signals republished from a worker's output.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Cumulative percentage reported by the worker.
    Progress { percent: f64 },
    /// One diagnostic line from the worker's stderr. Not terminal.
    Error { message: String },
    /// Worker exited. `exit_code` is absent when it died from a signal.
    Complete { exit_code: Option<i32> },
    /// Session was cancelled through the control endpoint.
    Cancelled,
    /// Another subscriber took over this session's stream.
    Superseded,
}

impl ProgressEvent {
    /// Terminal events end a stream; nothing is delivered after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Complete { .. } | ProgressEvent::Cancelled | ProgressEvent::Superseded
        )
    }
}
