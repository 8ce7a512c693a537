// Progress interpreter: turns raw worker output lines into progress events.

use std::process::ExitStatus;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use super::events::ProgressEvent;

/// First `NN%` / `NN.N%` token anywhere on the line (progress bars, log lines).
static PERCENT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3}(?:\.\d+)?)\s*%").expect("valid percent regex"));

/// A line that is nothing but a number, optionally with a percent sign.
static BARE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}(?:\.\d+)?)\s*%?$").expect("valid number regex"));

#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressInterpreter;

impl ProgressInterpreter {
    pub fn new() -> Self {
        Self
    }

    /// Interpret one stdout line. Unrecognized lines are dropped.
    pub fn interpret(&self, line: &str) -> Option<ProgressEvent> {
        let line = line.trim();
        let captures = BARE_NUMBER
            .captures(line)
            .or_else(|| PERCENT_TOKEN.captures(line));

        let Some(percent) = captures
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|p| (0.0..=100.0).contains(p))
        else {
            trace!("dropping worker output line: {:?}", line);
            return None;
        };

        Some(ProgressEvent::Progress { percent })
    }

    /// Interpret one stderr line. Diagnostics never end the session.
    pub fn interpret_diagnostic(&self, line: &str) -> Option<ProgressEvent> {
        let message = line.trim();
        if message.is_empty() {
            return None;
        }
        Some(ProgressEvent::Error {
            message: message.to_string(),
        })
    }

    /// The single terminal event for a worker exit.
    pub fn exited(&self, status: ExitStatus) -> ProgressEvent {
        ProgressEvent::Complete {
            exit_code: status.code(),
        }
    }
}
