use async_trait::async_trait;
use tracing::debug;

use super::process::{WorkerError, WorkerProcess};
use super::traits::{DownloadKey, WorkerLauncher};
use crate::config::WorkerConfig;

/// Launches the configured executable as
/// `<program> <args..> <filename> <output_dir>/<filename>`.
pub struct CommandLauncher {
    config: WorkerConfig,
}

impl CommandLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn argv(&self, key: &DownloadKey) -> Vec<std::ffi::OsString> {
        let output = self.config.output_dir.join(key.as_str());
        let mut argv: Vec<std::ffi::OsString> =
            self.config.args.iter().map(Into::into).collect();
        argv.push(key.as_str().into());
        argv.push(output.into_os_string());
        argv
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, key: &DownloadKey) -> Result<WorkerProcess, WorkerError> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let argv = self.argv(key);
        debug!("launching {} {:?}", self.config.program, argv);
        WorkerProcess::spawn(key.as_str(), &self.config.program, argv)
    }

    fn supports_pause(&self) -> bool {
        cfg!(unix) && self.config.signal_control
    }
}
