//! Core engine - job bookkeeping, shell spawning, process supervision

mod job;
pub mod shell;
mod supervisor;

pub use job::{JobEvent, JobHandle, JobId, JobState, JobSummary};
pub use supervisor::Supervisor;
