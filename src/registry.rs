//! Process Registry - durable record of named processes
//!
//! Persists `name -> ProcessRecord` as a pretty-printed JSON object so the
//! console can recover visibility into what is running after a restart.
//! The registry is advisory: every read or write failure is logged and
//! swallowed, and a missing or corrupt file reads as empty. Entries are
//! rewritten as raw JSON, so one this version cannot parse is skipped on
//! read but never dropped from the file.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Registry file contents, one raw JSON value per name
type RawEntries = serde_json::Map<String, serde_json::Value>;

/// Timestamp format used for `started_at` in the registry and the console log
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One tracked named process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// OS process id (absent if the spawn never produced one)
    pub pid: Option<u32>,
    /// Command line the process was launched with
    pub cmd: String,
    /// Working directory the process was launched in
    pub cwd: String,
    /// Launch time, local clock
    pub started_at: String,
    /// Fields written by other tools; carried through rewrites untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProcessRecord {
    pub fn new(pid: Option<u32>, cmd: &str, cwd: &Path, started_at: DateTime<Local>) -> Self {
        Self {
            pid,
            cmd: cmd.to_string(),
            cwd: cwd.display().to_string(),
            started_at: started_at.format(TIMESTAMP_FORMAT).to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

/// File-backed registry with whole-file read-modify-write updates
#[derive(Debug)]
pub struct ProcessRegistry {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process. Other
    // processes writing the same file still race, last writer wins.
    write_lock: Mutex<()>,
}

impl ProcessRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every readable record. Absent or unparsable files read as
    /// empty; malformed entries are left out.
    pub fn read(&self) -> BTreeMap<String, ProcessRecord> {
        self.read_raw()
            .into_iter()
            .filter_map(|(name, value)| {
                let record = parse_entry(&name, value)?;
                Some((name, record))
            })
            .collect()
    }

    /// Look up a single record
    pub fn get(&self, name: &str) -> Option<ProcessRecord> {
        let value = self.read_raw().remove(name)?;
        parse_entry(name, value)
    }

    /// Insert or replace the record for `name`
    pub fn upsert(&self, name: &str, record: ProcessRecord) {
        let value = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to encode registry entry {}: {}", name, e);
                return;
            }
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.read_raw();
        entries.insert(name.to_string(), value);
        self.write(&entries);
    }

    /// Delete the record for `name`; no-op when absent
    pub fn remove(&self, name: &str) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.read_raw();
        if entries.remove(name).is_some() {
            self.write(&entries);
        }
    }

    fn read_raw(&self) -> RawEntries {
        if !self.path.exists() {
            return RawEntries::new();
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Failed to read registry {}: {}", self.path.display(), e);
                return RawEntries::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!(
                    "Registry {} is corrupt, treating as empty: {}",
                    self.path.display(),
                    e
                );
                RawEntries::new()
            }
        }
    }

    fn write(&self, entries: &RawEntries) {
        if let Err(e) = self.try_write(entries) {
            log::warn!("Failed to write registry {}: {}", self.path.display(), e);
        }
    }

    fn try_write(&self, entries: &RawEntries) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write beside the target and rename over it so readers never see a
        // half-written file.
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_entry(name: &str, value: serde_json::Value) -> Option<ProcessRecord> {
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("Skipping malformed registry entry {}: {}", name, e);
            None
        }
    }
}
