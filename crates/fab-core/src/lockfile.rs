//! Daemon lockfile — enforces a single `fabd` process per machine.
//!
//! On startup the daemon writes a JSON lockfile to
//! `~/.config/fab/run/fabd.lock`. A second `fabd` invocation sees the
//! lockfile, checks whether the recorded pid is alive, and either refuses to
//! start or (with `--replace`) signals the incumbent and takes its place.
//!
//! ## Race safety
//!
//! `acquire()` uses `O_CREAT | O_EXCL` to atomically create the lockfile.
//! If two daemons race, exactly one wins the create — the loser gets
//! `AlreadyRunning` and can check whether the winner is still alive.
//!
//! ## Stale lockfile recovery
//!
//! If the pid in an existing lockfile is no longer alive (`kill(pid, 0)`
//! fails), the lockfile is stale and is removed automatically so the next
//! daemon can start.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Runtime identity written by the daemon once it has bound its webhook
/// listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    pub webhook_port: u16,
    pub started_at: String,
}

/// Result of trying to acquire the lockfile.
pub enum AcquireResult {
    /// We created the lockfile — we own it.
    Acquired,
    /// Another live daemon holds the lockfile.
    AlreadyRunning(DaemonLockfile),
    /// Stale lockfile was cleaned up — retry.
    StaleRemoved,
}

impl DaemonLockfile {
    /// Canonical lockfile path: `~/.config/fab/run/fabd.lock`.
    pub fn path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".config")
            .join("fab")
            .join("run")
            .join("fabd.lock")
    }

    /// Try to exclusively create and write the lockfile.
    pub fn acquire(&self) -> std::io::Result<AcquireResult> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL — fails if file exists
            .open(&path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::read() {
                Some(existing) if existing.is_alive() => {
                    Ok(AcquireResult::AlreadyRunning(existing))
                }
                _ => {
                    tracing::info!("removing stale daemon lockfile");
                    Self::remove();
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Acquire with automatic retry after stale cleanup.
    pub fn acquire_or_fail(&self) -> Result<(), String> {
        for attempt in 0..2 {
            match self.acquire() {
                Ok(AcquireResult::Acquired) => return Ok(()),
                Ok(AcquireResult::AlreadyRunning(existing)) => {
                    return Err(format!(
                        "daemon already running (pid={}, webhook_port={})",
                        existing.pid, existing.webhook_port,
                    ));
                }
                Ok(AcquireResult::StaleRemoved) if attempt == 0 => {
                    tracing::info!("stale lockfile removed, retrying acquire");
                    continue;
                }
                Ok(AcquireResult::StaleRemoved) => {
                    return Err("failed to acquire lockfile after stale cleanup".into());
                }
                Err(e) => return Err(format!("lockfile I/O error: {e}")),
            }
        }
        Err("lockfile acquire failed".into())
    }

    /// SIGTERM the incumbent daemon (if alive) and remove its lockfile,
    /// so a `--replace`/`-r` invocation can take over. No-op if no
    /// incumbent is running.
    pub fn replace_incumbent() -> std::io::Result<()> {
        if let Some(existing) = Self::read() {
            if existing.is_alive() {
                // SAFETY: signal 15 (SIGTERM) on a pid we just confirmed alive.
                unsafe {
                    libc::kill(existing.pid as i32, libc::SIGTERM);
                }
                for _ in 0..50 {
                    if !existing.is_alive() {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }
        Self::remove();
        Ok(())
    }

    /// Read the lockfile. Returns `None` if missing or unparseable.
    pub fn read() -> Option<Self> {
        let path = Self::path();
        let content = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove the lockfile.
    pub fn remove() {
        let _ = std::fs::remove_file(Self::path());
    }

    /// Check if the pid in this lockfile is still alive.
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
