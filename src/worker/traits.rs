use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use super::process::{WorkerError, WorkerProcess};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Filename is required")]
    Empty,
    #[error("invalid filename {0:?}")]
    PathLike(String),
}

/// Stable identifier of a download, derived from the requested filename.
///
/// The key also names the output file, so anything that could escape the
/// output directory is refused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadKey(String);

impl DownloadKey {
    pub fn parse(filename: &str) -> Result<Self, KeyError> {
        let name = filename.trim();
        if name.is_empty() {
            return Err(KeyError::Empty);
        }
        if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(KeyError::PathLike(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Launches the external downloader for a key.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, key: &DownloadKey) -> Result<WorkerProcess, WorkerError>;

    /// Whether pause/resume can be delivered to launched workers.
    fn supports_pause(&self) -> bool {
        false
    }
}
