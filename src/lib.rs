//! Orchestrates external downloader workers: one supervised process per
//! requested file, its output republished as per-session progress events over
//! server-sent events, with start/pause/resume/cancel control.

pub mod api;
pub mod config;
pub mod engine;
pub mod server;
pub mod worker;

use std::sync::Arc;

use api::gateway::ControlGateway;
use config::OrchestratorConfig;
use engine::registry::{RegistrySettings, SessionRegistry};
use worker::command::CommandLauncher;

/// Build the gateway for `config`, launching workers from `config.worker`.
pub fn gateway_from_config(config: &OrchestratorConfig) -> ControlGateway {
    let launcher = Arc::new(CommandLauncher::new(config.worker.clone()));
    let registry = SessionRegistry::new(launcher, RegistrySettings::from_config(config));
    ControlGateway::new(registry)
}
