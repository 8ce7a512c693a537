use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default address the HTTP endpoints bind to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

/// Worker program launched for each download.
pub const DEFAULT_WORKER_PROGRAM: &str = "python";

/// Leading arguments passed before the filename and output path.
pub const DEFAULT_WORKER_ARGS: &[&str] = &["client.py"];

/// Directory the worker writes finished files into.
pub const DEFAULT_OUTPUT_DIR: &str = "downloads";

/// Per-subscriber event queue capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Time a worker gets to exit after SIGTERM before it is force-killed.
pub const DEFAULT_TERMINATE_GRACE_MS: u64 = 5_000;

/// Time to wait for exit after force-kill before reporting a timeout.
pub const DEFAULT_FORCE_KILL_TIMEOUT_MS: u64 = 2_000;

/// Time to wait for the worker's pipes to reach EOF after it exits.
pub const DEFAULT_OUTPUT_DRAIN_MS: u64 = 1_000;

/// How long a finished session nobody has watched stays in the registry.
pub const DEFAULT_UNCLAIMED_RETENTION_SECS: u64 = 60;

/// Longest single line of worker output that is framed (64 KB).
pub const MAX_OUTPUT_LINE_BYTES: usize = 64 * 1024;

/// How the external downloader executable is launched.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before the filename and output path.
    pub args: Vec<String>,
    /// Directory that receives downloaded files.
    pub output_dir: PathBuf,
    /// Map pause/resume onto SIGSTOP/SIGCONT of the worker's process group.
    pub signal_control: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_WORKER_PROGRAM.to_string(),
            args: DEFAULT_WORKER_ARGS.iter().map(|s| s.to_string()).collect(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            signal_control: cfg!(unix),
        }
    }
}

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub listen_addr: SocketAddr,
    pub worker: WorkerConfig,
    pub event_buffer: usize,
    pub terminate_grace_ms: u64,
    pub force_kill_timeout_ms: u64,
    pub output_drain_ms: u64,
    pub unclaimed_retention_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            worker: WorkerConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            terminate_grace_ms: DEFAULT_TERMINATE_GRACE_MS,
            force_kill_timeout_ms: DEFAULT_FORCE_KILL_TIMEOUT_MS,
            output_drain_ms: DEFAULT_OUTPUT_DRAIN_MS,
            unclaimed_retention_secs: DEFAULT_UNCLAIMED_RETENTION_SECS,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document; absent fields keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid orchestrator config")?;
        Ok(config.normalized())
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    fn normalized(mut self) -> Self {
        self.event_buffer = self.event_buffer.max(1);
        self
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn force_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.force_kill_timeout_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }

    pub fn unclaimed_retention(&self) -> Duration {
        Duration::from_secs(self.unclaimed_retention_secs)
    }
}
