use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default WebSocket listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7170";

/// Default heartbeat timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;

/// Server options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Address the WebSocket server listens on
    pub listen_addr: String,
    /// JSON document served to every peer
    pub config_file: PathBuf,
    /// Heartbeat timeout; pings go out every half of it
    pub timeout: Duration,
}

impl Options {
    pub fn new(listen_addr: impl Into<String>, config_file: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            config_file: config_file.into(),
            timeout,
        }
    }

    /// Reject options the server can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }

    /// Read and parse the config file.
    ///
    /// Any JSON value is accepted and served verbatim.
    pub fn load_config(&self) -> Result<serde_json::Value, ConfigError> {
        load_config_file(&self.config_file)
    }
}

fn load_config_file(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let data = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Read config file {path:?} error: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse config file {path:?} error: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Heartbeat timeout must be greater than zero")]
    InvalidTimeout,
}
