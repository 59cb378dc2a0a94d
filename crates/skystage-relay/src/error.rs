//! Relay errors.

use thiserror::Error;

/// Errors surfaced by the relay client's fallible setup paths.
///
/// Runtime failures (dropped connections, rejected handshakes) are reported
/// as `error` events through the dispatcher instead.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but holds an unusable value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
