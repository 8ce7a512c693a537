// Session state machine: which control actions are legal in which state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a live session. A key with no session is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Downloading | SessionState::Paused)
    }

    /// State a worker exit moves an active session into.
    pub fn after_exit(exit_code: Option<i32>) -> Self {
        if exit_code == Some(0) {
            SessionState::Completed
        } else {
            SessionState::Failed
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Downloading => "downloading",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(ControlAction::Start),
            "pause" => Some(ControlAction::Pause),
            "resume" => Some(ControlAction::Resume),
            "cancel" => Some(ControlAction::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlAction::Start => "start",
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// What the registry must do to carry out an accepted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Idle → Downloading.
    Spawn,
    /// Downloading → Paused.
    Pause,
    /// Paused → Downloading.
    Resume,
    /// Downloading/Paused → Idle, stopping the worker.
    Terminate,
    /// Completed/Failed → Idle.
    Reset,
    /// Cancel on an idle key.
    Nothing,
}

/// Why an action is not legal in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    AlreadyActive,
    NoSuchSession,
    /// Legal action, wrong state (e.g. resume while downloading).
    WrongState(SessionState),
}

/// Validate `action` against the current state (`None` = idle).
pub fn transition(current: Option<SessionState>, action: ControlAction) -> Result<Transition, Refusal> {
    use ControlAction::*;
    use SessionState::*;

    match (current, action) {
        (None, Start) => Ok(Transition::Spawn),
        (None, Cancel) => Ok(Transition::Nothing),
        (None, Pause | Resume) => Err(Refusal::NoSuchSession),

        (Some(Downloading | Paused), Start) => Err(Refusal::AlreadyActive),
        (Some(Downloading), Pause) => Ok(Transition::Pause),
        (Some(Paused), Resume) => Ok(Transition::Resume),
        (Some(Downloading | Paused), Cancel) => Ok(Transition::Terminate),

        (Some(Completed | Failed), Cancel) => Ok(Transition::Reset),
        (Some(state), _) => Err(Refusal::WrongState(state)),
    }
}
