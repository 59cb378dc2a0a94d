//! Client configuration.
//!
//! Configuration can be loaded from:
//! - An optional `skystage.toml` in the working directory
//! - Environment variables (`SKYSTAGE_WS_URL`, `SKYSTAGE_TOKEN`, ...)
//!
//! Environment variables win over the file; serde defaults fill the rest.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::error::RelayError;
use crate::token::{FileTokenStore, MemoryTokenStore, TokenStore};

/// Default configuration file, looked up relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "skystage.toml";

/// Prefix of the environment variables read by [`RelayConfig::load`].
pub const ENV_PREFIX: &str = "SKYSTAGE";

/// Relay client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Collaboration server URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Bearer token. Ignored when `token_path` is set.
    #[serde(default)]
    pub token: Option<String>,

    /// File holding the bearer token, re-read on every connect.
    #[serde(default)]
    pub token_path: Option<PathBuf>,

    /// Delay before the first reconnect attempt, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Reconnect attempts before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// How long to wait for the server's handshake reply, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

// Default value functions
fn default_ws_url() -> String {
    "ws://localhost:3001/ws".to_string()
}

fn default_reconnect_delay() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_handshake_timeout() -> u64 {
    10_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            token: None,
            token_path: None,
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl RelayConfig {
    /// Load from `skystage.toml` (if present) and `SKYSTAGE_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value is invalid.
    pub fn load() -> Result<Self, RelayError> {
        Self::load_from(Some(Path::new(DEFAULT_CONFIG_FILE)), ENV_PREFIX)
    }

    /// Load from an optional file and environment variables with `env_prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value is invalid.
    pub fn load_from(file: Option<&Path>, env_prefix: &str) -> Result<Self, RelayError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: RelayConfig = builder
            .add_source(config::Environment::with_prefix(env_prefix).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or a value is invalid.
    pub fn from_toml_str(contents: &str) -> Result<Self, RelayError> {
        let config: RelayConfig = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<(), RelayError> {
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(RelayError::InvalidConfig(format!(
                "ws_url must be a ws:// or wss:// URL, got {:?}",
                self.ws_url
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "handshake_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Reconnect policy described by this configuration.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Handshake timeout.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Token store described by this configuration.
    #[must_use]
    pub fn token_store(&self) -> Arc<dyn TokenStore> {
        match &self.token_path {
            Some(path) => Arc::new(FileTokenStore::new(path.clone())),
            None => Arc::new(MemoryTokenStore::new(self.token.clone())),
        }
    }
}
