//! Client configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};

use crate::error::{Result, SvcDirError};
use crate::locator::LocateStrategy;
use crate::types::AnnounceRequest;

/// Environment variable that overrides `directory_override`.
pub const DIRECTORY_ENV: &str = "SVCDIR_DIRECTORY";

/// Port directories listen on when an address carries none.
pub const DEFAULT_DIRECTORY_PORT: u16 = 4080;

/// Configuration for a [`DirectoryClient`](crate::DirectoryClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory `host:port` tried before every other locator strategy.
    pub directory_override: Option<String>,

    /// JSON file listing the directories configured for this host.
    pub local_config_path: PathBuf,

    /// Directory address every host is expected to serve locally.
    pub well_known_address: String,

    /// File holding the deployment role of this host.
    pub role_file: PathBuf,

    /// File holding the deployment domain of this host.
    pub domain_file: PathBuf,

    /// Port appended to addresses that carry none.
    pub directory_port: u16,

    /// Which locator strategies to run.
    pub locate_strategy: LocateStrategy,

    /// Upper bound for a single exchange with one directory, in milliseconds.
    pub request_timeout_ms: u64,

    /// Routing override sent with every request, lowest precedence.
    pub routing_override: Option<String>,

    /// Defaults used by `announce_from_config`.
    pub announce: Option<AnnounceRequest>,

    /// Deannounce everything still registered when the client is dropped.
    pub deannounce_on_drop: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            directory_override: None,
            local_config_path: PathBuf::from("/etc/svcdir/client.json"),
            well_known_address: format!("127.0.0.1:{}", DEFAULT_DIRECTORY_PORT),
            role_file: PathBuf::from("/etc/svcdir/role"),
            domain_file: PathBuf::from("/etc/svcdir/domain"),
            directory_port: DEFAULT_DIRECTORY_PORT,
            locate_strategy: LocateStrategy::Chain,
            request_timeout_ms: 2000,
            routing_override: None,
            announce: None,
            deannounce_on_drop: false,
        }
    }
}

impl ClientConfig {
    /// Loads a configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading client configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `SVCDIR_DIRECTORY` when it is set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(directory) = std::env::var(DIRECTORY_ENV) {
            let directory = directory.trim();
            if !directory.is_empty() {
                debug!("{} overrides directory to {}", DIRECTORY_ENV, directory);
                self.directory_override = Some(directory.to_string());
            }
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Checks values that would make every request fail.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(SvcDirError::ConfigError(
                "request_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.directory_port == 0 {
            return Err(SvcDirError::ConfigError(
                "directory_port cannot be zero".into(),
            ));
        }
        if let Some(announce) = &self.announce {
            if announce.service.is_empty() {
                return Err(SvcDirError::ConfigError(
                    "announce.service cannot be empty".into(),
                ));
            }
        }
        Ok(())
    }
}
