//! Typed errors for the few failures callers are expected to match on.
//!
//! Everything else in the supervisor is absorbed and logged.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by [`crate::core::Supervisor::start`]
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The command was empty or whitespace only
    #[error("command must not be empty")]
    EmptyCommand,
}

/// Errors raised while resolving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown service: {0}")]
    UnknownService(String),
}
