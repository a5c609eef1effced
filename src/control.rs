//! Control API - JSON commands accepted by the console
//!
//! One command per line in, one response per line out. This is the surface
//! a dashboard (or any other front end) drives to start, stop and inspect
//! named processes.

use crate::core::JobSummary;
use crate::probe::ProbeResult;
use crate::registry::ProcessRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Command sent to the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Start a process; with a name, replaces any running instance
    Start {
        name: Option<String>,
        command: String,
        cwd: Option<PathBuf>,
    },
    /// Start a configured service preset under its own name
    StartService { service: String },
    /// Stop a named process
    Stop { name: String },
    /// Stop every tracked job
    StopAll,
    /// Jobs, registry contents and probe results
    Status,
    /// Liveness of a named process
    Alive { name: String },
    /// TCP reachability of a port
    Probe { host: Option<String>, port: u16 },
    /// Live jobs
    Jobs,
    /// Last lines of the console log
    Tail {
        lines: Option<usize>,
        pattern: Option<String>,
    },
    /// End the control session; processes keep running
    Quit,
}

/// Response to a control command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self::Ok { data: None }
    }

    pub fn ok_with_data(data: serde_json::Value) -> Self {
        Self::Ok { data: Some(data) }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Everything the status panel shows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub jobs: Vec<JobSummary>,
    pub tracked: BTreeMap<String, ProcessRecord>,
    pub probes: Vec<ProbeResult>,
}
