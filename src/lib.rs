//! procdeck - named process console
//!
//! Starts local commands under caller-chosen names with at most one live
//! instance per name, streams their output into a shared console log, and
//! keeps a JSON registry of what is running so it can still be stopped
//! after the controller restarts.

pub mod app;
pub mod config;
pub mod console_log;
pub mod control;
pub mod core;
pub mod error;
pub mod probe;
pub mod registry;

// Re-exports
pub use app::App;
pub use config::Config;
pub use console_log::ConsoleLog;
pub use control::{ControlCommand, ControlResponse};
pub use core::{JobEvent, JobId, JobState, Supervisor};
pub use error::{ConfigError, SupervisorError};
pub use registry::{ProcessRecord, ProcessRegistry};

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
