//! Named Process Supervisor - at most one live process per name
//!
//! Each job's output is drained by its own Tokio task into the shared
//! console log. That task owns the child process. The control path kills
//! by pid and then wakes the task to reap it. Cleanup on exit runs from a
//! drop guard so it happens
//! on every exit path, and only touches the name/registry entry if the name
//! still maps to the exiting job.

use super::job::{JobEvent, JobHandle, JobId, JobState, JobSummary};
use super::shell;
use crate::config::Config;
use crate::console_log::{ConsoleLog, JobLog};
use crate::error::SupervisorError;
use crate::registry::{ProcessRecord, ProcessRegistry};
use chrono::Local;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

/// Terminal states kept for `job_state` queries
const FINISHED_HISTORY: usize = 256;

#[derive(Debug, Default)]
struct State {
    last_job_id: u64,
    spawning: HashSet<JobId>,
    jobs: HashMap<JobId, JobHandle>,
    named: HashMap<String, JobId>,
    finished: VecDeque<(JobId, JobState)>,
}

impl State {
    fn next_job_id(&mut self) -> JobId {
        self.last_job_id += 1;
        JobId(self.last_job_id)
    }

    fn take_named(&mut self, name: &str) -> Option<JobHandle> {
        let job_id = self.named.remove(name)?;
        self.jobs.remove(&job_id)
    }

    fn record_finished(&mut self, job_id: JobId, state: JobState) {
        if self.finished.len() >= FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back((job_id, state));
    }
}

struct Inner {
    state: Mutex<State>,
    registry: ProcessRegistry,
    log: ConsoleLog,
    default_cwd: PathBuf,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl Inner {
    // Lock order: state, then the registry's own write lock
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: JobEvent) {
        // No receiver is fine
        let _ = self.events.send(event);
    }

    fn kill_handle(&self, state: &mut State, mut handle: JobHandle) {
        log::info!(
            "Stopping job {} ({})",
            handle.job_id,
            handle.name.as_deref().unwrap_or("unnamed")
        );
        // Signalled before returning; the streaming task only reaps
        if let Some(pid) = handle.pid {
            if let Err(e) = shell::force_kill(pid) {
                log::debug!("Kill of job {} (pid {}) failed: {}", handle.job_id, pid, e);
            }
        }
        handle.terminate();
        state.record_finished(handle.job_id, JobState::Killed);
        self.emit(JobEvent::Killed {
            job_id: handle.job_id,
        });
    }
}

/// Supervisor for named and ad-hoc processes. Cheap to clone; clones share
/// the same state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its event stream
    pub fn new(
        registry: ProcessRegistry,
        log: ConsoleLog,
        default_cwd: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                inner: Arc::new(Inner {
                    state: Mutex::new(State::default()),
                    registry,
                    log,
                    default_cwd: default_cwd.into(),
                    events: tx,
                }),
            },
            rx,
        )
    }

    /// Create a supervisor using the configured registry, log and root
    pub fn from_config(config: &Config) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        Self::new(
            ProcessRegistry::new(&config.registry),
            ConsoleLog::new(&config.console_log),
            &config.root,
        )
    }

    /// Start `command` through the host shell and return its job id without
    /// waiting for it to exit.
    ///
    /// With a `name`, any process already running under that name is
    /// stopped first. A spawn failure still consumes a job id; it is logged
    /// and leaves no live job or registry entry behind.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        name: Option<&str>,
        command: &str,
        cwd: Option<&Path>,
    ) -> Result<JobId, SupervisorError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }

        let job_id = {
            let mut state = self.inner.lock();
            let job_id = state.next_job_id();
            state.spawning.insert(job_id);
            job_id
        };

        if let Some(name) = name {
            self.stop(name);
        }

        let cwd = cwd
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.inner.default_cwd.clone());
        let started_at = Local::now();

        // Header goes out before the spawn so output never precedes it
        self.inner.log.write_header(job_id, &started_at, &cwd, command);

        let child = match shell::spawn(command, &cwd) {
            Ok(child) => child,
            Err(e) => {
                log::warn!("Job {} failed to spawn `{}`: {}", job_id, command, e);
                let mut job_log = self.inner.log.job_writer(job_id);
                job_log.error(&e.to_string());
                job_log.footer();

                let mut state = self.inner.lock();
                state.spawning.remove(&job_id);
                state.record_finished(job_id, JobState::Failed);
                drop(state);

                self.inner.emit(JobEvent::Failed {
                    job_id,
                    error: e.to_string(),
                });
                return Ok(job_id);
            }
        };

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = JobHandle {
            job_id,
            name: name.map(str::to_string),
            pid,
            command: command.to_string(),
            cwd: cwd.clone(),
            started_at,
            kill: Some(kill_tx),
        };

        {
            let mut state = self.inner.lock();
            state.spawning.remove(&job_id);

            if let Some(name) = name {
                // A concurrent start for the same name may have won the race
                if let Some(previous) = state.take_named(name) {
                    self.inner.kill_handle(&mut state, previous);
                }
                state.named.insert(name.to_string(), job_id);
                self.inner.registry.upsert(
                    name,
                    ProcessRecord::new(pid, command, &cwd, started_at),
                );
            }
            state.jobs.insert(job_id, handle);
        }

        log::info!(
            "Job {} started{} (pid {:?}): {}",
            job_id,
            name.map(|n| format!(" as {}", n)).unwrap_or_default(),
            pid,
            command
        );
        self.inner.emit(JobEvent::Started {
            job_id,
            name: name.map(str::to_string),
            pid,
        });

        let finalizer = Finalizer {
            inner: self.inner.clone(),
            job_id,
            name: name.map(str::to_string),
            log: self.inner.log.job_writer(job_id),
            exit_code: None,
        };
        tokio::spawn(stream_output(finalizer, child, kill_rx));

        Ok(job_id)
    }

    /// Stop the process running under `name`. Idempotent; never fails.
    ///
    /// Falls back to killing the registry's pid when the process is not
    /// tracked in memory (e.g. started by an earlier controller), and always
    /// removes the registry entry.
    pub fn stop(&self, name: &str) {
        let fallback_pid = {
            let mut state = self.inner.lock();
            let live_pid = match state.take_named(name) {
                Some(handle) => {
                    let pid = handle.pid;
                    self.inner.kill_handle(&mut state, handle);
                    pid
                }
                None => None,
            };

            let recorded_pid = self.inner.registry.get(name).and_then(|r| r.pid);
            self.inner.registry.remove(name);
            recorded_pid.filter(|&pid| Some(pid) != live_pid)
        };

        if let Some(pid) = fallback_pid {
            log::info!("Stopping untracked {} by registry pid {}", name, pid);
            if let Err(e) = shell::force_kill(pid) {
                log::warn!("Could not kill pid {} for {}: {}", pid, name, e);
            }
        }
    }

    /// Kill every tracked job, named or not, and forget them.
    ///
    /// Registry entries of the named jobs are removed; entries for names
    /// only known from the registry are left for `stop(name)`.
    pub fn stop_all(&self) {
        let mut state = self.inner.lock();
        let handles: Vec<JobHandle> = state.jobs.drain().map(|(_, h)| h).collect();
        let names: Vec<String> = state.named.drain().map(|(name, _)| name).collect();

        for handle in handles {
            self.inner.kill_handle(&mut state, handle);
        }
        for name in names {
            self.inner.registry.remove(&name);
        }
    }

    /// Live jobs, oldest first
    pub fn jobs(&self) -> Vec<JobSummary> {
        let state = self.inner.lock();
        let mut jobs: Vec<JobSummary> = state.jobs.values().map(JobHandle::summary).collect();
        jobs.sort_by_key(|j| j.job_id);
        jobs
    }

    /// Job currently running under `name`
    pub fn job_for(&self, name: &str) -> Option<JobId> {
        self.inner.lock().named.get(name).copied()
    }

    /// Where a job is in its lifecycle; `None` for unknown or long-forgotten ids
    pub fn job_state(&self, job_id: JobId) -> Option<JobState> {
        let state = self.inner.lock();
        if state.spawning.contains(&job_id) {
            return Some(JobState::Spawning);
        }
        if state.jobs.contains_key(&job_id) {
            return Some(JobState::Running);
        }
        state
            .finished
            .iter()
            .rev()
            .find(|(id, _)| *id == job_id)
            .map(|(_, s)| *s)
    }

    /// Whether a process is running under `name`, in memory or per the
    /// registry's pid
    pub fn is_alive(&self, name: &str) -> bool {
        if self.job_for(name).is_some() {
            return true;
        }
        self.inner
            .registry
            .get(name)
            .and_then(|record| record.pid)
            .map(shell::is_process_running)
            .unwrap_or(false)
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn console_log(&self) -> &ConsoleLog {
        &self.inner.log
    }
}

/// Exit bookkeeping for one job, run on drop
struct Finalizer {
    inner: Arc<Inner>,
    job_id: JobId,
    name: Option<String>,
    log: JobLog,
    exit_code: Option<i32>,
}

impl Finalizer {
    fn output(&mut self, line: &str) {
        log::trace!("[job {}] {}", self.job_id, line);
        self.log.line(line);
        self.inner.emit(JobEvent::Output {
            job_id: self.job_id,
            line: line.to_string(),
        });
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        self.log.footer();

        let mut state = self.inner.lock();
        if state.jobs.remove(&self.job_id).is_some() {
            let outcome = self.exit_code.map(JobState::Exited).unwrap_or(JobState::Failed);
            state.record_finished(self.job_id, outcome);
        }

        // A newer job may own the name by now; leave it alone
        if let Some(name) = &self.name {
            if state.named.get(name) == Some(&self.job_id) {
                state.named.remove(name);
                self.inner.registry.remove(name);
            }
        }
        drop(state);

        log::info!("Job {} ended (exit {:?})", self.job_id, self.exit_code);
        self.inner.emit(JobEvent::Exited {
            job_id: self.job_id,
            exit_code: self.exit_code,
        });
    }
}

/// Drain stdout and stderr line by line until both close or a kill is
/// requested, then reap the child.
async fn stream_output(mut finalizer: Finalizer, mut child: Child, mut kill_rx: oneshot::Receiver<()>) {
    let mut stdout = child.stdout.take().map(|s| LineReader::new(BufReader::new(s)));
    let mut stderr = child.stderr.take().map(|s| LineReader::new(BufReader::new(s)));
    let mut killed = false;

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            // Err means the handle was dropped without terminate; reap anyway
            _ = &mut kill_rx => {
                killed = true;
                break;
            }
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(line) => finalizer.output(&line),
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line {
                Some(line) => finalizer.output(&line),
                None => stderr = None,
            },
        }
    }

    // Outputs can close while the process keeps running
    let status = if killed {
        kill(&mut child);
        child.wait().await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => {
                kill(&mut child);
                child.wait().await
            }
        }
    };

    match status {
        Ok(status) => {
            let code = shell::exit_code(status);
            finalizer.log.exit(code);
            finalizer.exit_code = Some(code);
        }
        Err(e) => {
            log::warn!("Job {}: wait failed: {}", finalizer.job_id, e);
            finalizer.log.error(&e.to_string());
        }
    }
}

/// Newline-delimited reader that keeps going through invalid UTF-8.
/// Cancel safe: a partly read line stays buffered for the next call.
struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut Option<LineReader<R>>) -> Option<String> {
    let reader = reader.as_mut()?;
    match reader.next_line().await {
        Ok(line) => line,
        Err(e) => {
            // Broken pipe and the like end this stream only
            log::debug!("Output stream closed with error: {}", e);
            None
        }
    }
}

/// Reap path for a killed job. The process group was already signalled
/// by whoever asked for the kill.
fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::debug!("start_kill failed: {}", e);
    }
}
