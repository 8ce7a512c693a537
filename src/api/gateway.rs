// Control gateway: turns inbound `{key, action}` requests into registry calls.

use serde::Serialize;
use tracing::info;

use crate::engine::registry::{ControlError, SessionRegistry};
use crate::engine::state::{ControlAction, Transition};
use crate::worker::traits::DownloadKey;

#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub key: DownloadKey,
    pub action: ControlAction,
}

/// Structured result of a control request. Every refusal carries a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    Accepted { message: String },
    Rejected { reason: RejectReason, message: String },
    AlreadyActive { message: String },
    NoSuchSession { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnsupportedAction,
    InvalidTransition,
    SpawnFailed,
    WorkerFailure,
}

impl ControlOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ControlOutcome::Accepted { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            ControlOutcome::Accepted { message }
            | ControlOutcome::Rejected { message, .. }
            | ControlOutcome::AlreadyActive { message }
            | ControlOutcome::NoSuchSession { message } => message,
        }
    }
}

impl From<ControlError> for ControlOutcome {
    fn from(error: ControlError) -> Self {
        let message = error.to_string();
        match error {
            ControlError::AlreadyActive(_) => ControlOutcome::AlreadyActive { message },
            ControlError::NoSuchSession(_) => ControlOutcome::NoSuchSession { message },
            ControlError::UnsupportedAction(_) => ControlOutcome::Rejected {
                reason: RejectReason::UnsupportedAction,
                message,
            },
            ControlError::InvalidTransition { .. } => ControlOutcome::Rejected {
                reason: RejectReason::InvalidTransition,
                message,
            },
            ControlError::Spawn(_) => ControlOutcome::Rejected {
                reason: RejectReason::SpawnFailed,
                message,
            },
            ControlError::Worker(_) => ControlOutcome::Rejected {
                reason: RejectReason::WorkerFailure,
                message,
            },
        }
    }
}

#[derive(Clone)]
pub struct ControlGateway {
    registry: SessionRegistry,
}

impl ControlGateway {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlOutcome {
        let ControlRequest { key, action } = request;
        match self.registry.apply(&key, action).await {
            Ok(step) => {
                let message = accepted_message(&key, action, step);
                info!("{}", message);
                ControlOutcome::Accepted { message }
            }
            Err(e) => {
                info!("{} {} rejected: {}", action, key, e);
                e.into()
            }
        }
    }
}

fn accepted_message(key: &DownloadKey, action: ControlAction, step: Transition) -> String {
    match step {
        Transition::Spawn => format!("Download started for {}", key),
        Transition::Pause => format!("Download paused for {}", key),
        Transition::Resume => format!("Download resumed for {}", key),
        Transition::Terminate => format!("Download cancelled for {}", key),
        Transition::Reset => format!("Download reset for {}", key),
        Transition::Nothing => format!("No active download for {}, {} ignored", key, action),
    }
}
