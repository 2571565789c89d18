//! Master configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via DROVER_CONFIG or --config)
//! 3. Environment variables

use drover_proto::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading or parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Master settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Address the slave listener binds to.
    pub bind_addr: SocketAddr,
    /// Seconds a new connection gets to complete the registration
    /// handshake.
    pub handshake_timeout_secs: u64,
    /// Maximum number of registered slaves (0 = unlimited).
    pub max_slaves: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            handshake_timeout_secs: 30,
            max_slaves: 0,
        }
    }
}

impl MasterConfig {
    /// Loads configuration from file (if `DROVER_CONFIG` is set), then
    /// applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("DROVER_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies environment variable overrides to this configuration.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(bind) = std::env::var("DROVER_BIND") {
            self.bind_addr = bind
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DROVER_BIND", bind))?;
        }
        if let Ok(timeout) = std::env::var("DROVER_HANDSHAKE_TIMEOUT") {
            self.handshake_timeout_secs = timeout
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DROVER_HANDSHAKE_TIMEOUT", timeout))?;
        }
        if let Ok(max) = std::env::var("DROVER_MAX_SLAVES") {
            self.max_slaves = max
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DROVER_MAX_SLAVES", max))?;
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
