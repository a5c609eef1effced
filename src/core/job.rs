//! Job bookkeeping types

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Identifier of one spawn attempt; strictly increasing, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a job: `Spawning -> Running -> (Exited | Killed)`, or
/// `Spawning -> Failed` when the OS rejects the spawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "exit_code", rename_all = "snake_case")]
pub enum JobState {
    Spawning,
    Running,
    Exited(i32),
    Killed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawning => write!(f, "spawning"),
            Self::Running => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited ({})", code),
            Self::Killed => write!(f, "killed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Events published by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started {
        job_id: JobId,
        name: Option<String>,
        pid: Option<u32>,
    },
    Output {
        job_id: JobId,
        line: String,
    },
    /// Sent by `stop`/`stop_all`; an `Exited` event follows once the
    /// streaming task observes the exit
    Killed {
        job_id: JobId,
    },
    /// The streaming task finished; `exit_code` is `None` if waiting failed
    Exited {
        job_id: JobId,
        exit_code: Option<i32>,
    },
    /// Spawn was rejected; no process exists
    Failed {
        job_id: JobId,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Started { job_id, .. }
            | Self::Output { job_id, .. }
            | Self::Killed { job_id }
            | Self::Exited { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

/// A live job. The kill switch is the only way the control path acts on
/// the process; the streaming task owns the child itself.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: JobId,
    pub name: Option<String>,
    pub pid: Option<u32>,
    pub command: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Local>,
    pub(crate) kill: Option<oneshot::Sender<()>>,
}

impl JobHandle {
    /// Ask the streaming task to kill the process. Idempotent.
    pub(crate) fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            // Err means the task already finished
            let _ = kill.send(());
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id,
            name: self.name.clone(),
            pid: self.pid,
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            started_at: self.started_at,
        }
    }
}

/// Serializable view of a live job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub name: Option<String>,
    pub pid: Option<u32>,
    pub command: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Local>,
}
