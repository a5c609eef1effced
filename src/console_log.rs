//! Shared console log - append-only record of every job's output
//!
//! Layout per job:
//!
//! ```text
//! ===== [2024-05-01 12:00:00] JOB 3 START =====
//! CWD: /srv/app
//! CMD: npm run dev
//! <raw output lines>
//!
//! [exit 0]
//! ===== JOB 3 END =====
//! ```
//!
//! Writers only ever append, so several jobs can write concurrently and a
//! tail reader may observe a line mid-write.

use crate::core::JobId;
use crate::registry::TIMESTAMP_FORMAT;
use chrono::{DateTime, Local};
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How much of a file's tail is read when extracting the last lines
const TAIL_WINDOW_BYTES: u64 = 256 * 1024;

/// Upper bound on results from [`find_log_files`]
pub const MAX_LOG_FILES: usize = 200;

/// Handle to the shared console log file
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    path: PathBuf,
}

impl ConsoleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw text, logging (not returning) any failure
    pub fn append(&self, text: &str) {
        if let Err(e) = self.open().and_then(|mut f| f.write_all(text.as_bytes())) {
            log::warn!("Failed to append to {}: {}", self.path.display(), e);
        }
    }

    /// Write the block that opens a job
    pub fn write_header(&self, job_id: JobId, started_at: &DateTime<Local>, cwd: &Path, command: &str) {
        self.append(&format!(
            "\n===== [{}] JOB {} START =====\nCWD: {}\nCMD: {}\n",
            started_at.format(TIMESTAMP_FORMAT),
            job_id,
            cwd.display(),
            command
        ));
    }

    /// Open a per-job writer for output, trailer and footer
    pub fn job_writer(&self, job_id: JobId) -> JobLog {
        let file = match self.open() {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!(
                    "Job {}: cannot open console log {}: {}",
                    job_id,
                    self.path.display(),
                    e
                );
                None
            }
        };
        JobLog { job_id, file }
    }

    /// Last `lines` lines of the console log, optionally filtered
    pub fn tail(&self, lines: usize, filter: Option<&Regex>) -> Vec<String> {
        if !self.path.exists() {
            return Vec::new();
        }
        match tail_file(&self.path, lines, filter) {
            Ok(tail) => tail,
            Err(e) => {
                log::warn!("Failed to tail {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    fn open(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

/// Append-mode writer owned by one job's streaming task
pub struct JobLog {
    job_id: JobId,
    file: Option<File>,
}

impl JobLog {
    /// One line of process output
    pub fn line(&mut self, line: &str) {
        self.write(&format!("{}\n", line));
    }

    /// Exit trailer
    pub fn exit(&mut self, code: i32) {
        self.write(&format!("\n[exit {}]\n", code));
    }

    /// Error trailer (spawn or wait failure)
    pub fn error(&mut self, message: &str) {
        self.write(&format!("\n[error] {}\n", message));
    }

    /// End-of-job footer
    pub fn footer(&mut self) {
        let footer = format!("===== JOB {} END =====\n", self.job_id);
        self.write(&footer);
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    fn write(&mut self, text: &str) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(text.as_bytes()) {
                log::warn!("Job {}: console log write failed: {}", self.job_id, e);
            }
        }
    }
}

/// Read the last `lines` lines of a file.
///
/// Only the trailing window is read, and bytes are decoded lossily, so a
/// multi-byte character split by a concurrent writer never fails the read.
pub fn tail_file(path: &Path, lines: usize, filter: Option<&Regex>) -> std::io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let size = file.seek(SeekFrom::End(0))?;
    let start = size.saturating_sub(TAIL_WINDOW_BYTES);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((size - start) as usize);
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut all: Vec<&str> = text.lines().collect();
    // A window that starts mid-file almost always starts mid-line
    if start > 0 && !all.is_empty() {
        all.remove(0);
    }

    let kept: Vec<String> = all
        .into_iter()
        .filter(|line| filter.map(|re| re.is_match(line)).unwrap_or(true))
        .map(str::to_string)
        .collect();

    let skip = kept.len().saturating_sub(lines);
    Ok(kept.into_iter().skip(skip).collect())
}

/// Recursively collect `*.log` files under `root`, sorted, at most `max_files`
pub fn find_log_files(root: &Path, max_files: usize) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Skipping {}: {}", dir.display(), e);
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file()
                && path.extension().and_then(|s| s.to_str()) == Some("log")
            {
                found.push(path);
                if found.len() >= max_files {
                    found.sort();
                    return found;
                }
            }
        }
    }

    found.sort();
    found
}
