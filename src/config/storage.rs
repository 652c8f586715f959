//! Configuration Storage
//!
//! Reads the JSON configuration file.
//! Default location: ~/.oxidetunnel/config.json

use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::{TunnelConfig, CONFIG_VERSION};
use crate::ssh::SshError;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("Config file {0:?} not found")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

impl From<StorageError> for SshError {
    fn from(err: StorageError) -> Self {
        SshError::Configuration(err.to_string())
    }
}

/// Get the configuration directory (~/.oxidetunnel)
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".oxidetunnel"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the default config file path
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration file reader
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load configuration, or defaults if the file doesn't exist
    pub async fn load(&self) -> Result<TunnelConfig, StorageError> {
        match self.load_required().await {
            Err(StorageError::NotFound(_)) => Ok(TunnelConfig::default()),
            other => other,
        }
    }

    /// Load configuration; a missing file is an error
    pub async fn load_required(&self) -> Result<TunnelConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let config: TunnelConfig = serde_json::from_str(&contents)?;
        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        tracing::debug!("Loaded config from {:?}", self.path);
        Ok(config)
    }
}
