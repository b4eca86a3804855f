//! Single-flight dispatch lock.
//!
//! One JSON file at a fixed path records the owning process, the task being
//! worked, and when it started. A lock owned by a live process means a cycle
//! is in flight and the current cycle must yield; a lock owned by a dead
//! process is a crash leftover and is discarded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner_pid: i32,
    pub task_id: Option<i64>,
    pub started_at: i64,
}

/// Dispatch lock handle bound to one path.
#[derive(Debug, Clone)]
pub struct DispatchLock {
    path: PathBuf,
}

/// True when a process with this pid exists (signal 0 probes without
/// delivering). EPERM still means the process is alive.
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl DispatchLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock. Returns the blocking holder when a live process
    /// owns it; discards a stale file and acquires otherwise.
    pub fn acquire(&self, task_id: Option<i64>) -> Result<Option<LockInfo>> {
        if let Some(existing) = self.read()? {
            if pid_alive(existing.owner_pid) {
                debug!(
                    pid = existing.owner_pid,
                    task = ?existing.task_id,
                    "dispatch lock held by live process"
                );
                return Ok(Some(existing));
            }
            warn!(
                pid = existing.owner_pid,
                task = ?existing.task_id,
                "discarding stale dispatch lock from dead process"
            );
        }

        let info = LockInfo {
            owner_pid: std::process::id() as i32,
            task_id,
            started_at: crate::db::now_ms(),
        };
        self.write(&info)?;
        Ok(None)
    }

    /// Update the lock in place with the task id chosen after acquisition.
    pub fn set_task(&self, task_id: i64) -> Result<()> {
        if let Some(mut info) = self.read()? {
            info.task_id = Some(task_id);
            self.write(&info)?;
        }
        Ok(())
    }

    /// Remove the lock file. Safe to call on every exit path; a missing file
    /// is not an error.
    pub fn release(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing lock {}", self.path.display())),
        }
    }

    fn read(&self) -> Result<Option<LockInfo>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading lock {}", self.path.display()));
            }
        };

        match serde_json::from_str(&raw) {
            Ok(info) => Ok(Some(info)),
            // An unparseable lock file is treated as stale rather than
            // wedging dispatch forever.
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "ignoring corrupt lock file");
                Ok(None)
            }
        }
    }

    fn write(&self, info: &LockInfo) -> Result<()> {
        let json = serde_json::to_string_pretty(info)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing lock {}", self.path.display()))
    }
}
