//! Dedup store — bounded set of seen issue-event ids, so a webhook retry or
//! a poller re-scan never double-dispatches the same comment or update.
//!
//! Same persistence shape as [`crate::runtime_store`]: JSON array,
//! write-tmp-then-rename. With no path configured the store is in-memory
//! only (used for tests and for projects that don't need restart-durable
//! dedup).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::runtime_store::atomic_write_json;
use crate::types::DedupEntry;

const DEFAULT_MAX_AGE_SECS: i64 = 24 * 60 * 60;
const DEFAULT_MAX_ENTRIES: usize = 10_000;

pub struct DedupStore {
    path: Option<PathBuf>,
    max_age: Duration,
    max_entries: usize,
    entries: Mutex<Vec<DedupEntry>>,
}

impl DedupStore {
    pub fn new(path: Option<PathBuf>) -> Result<Self> {
        let entries = match &path {
            Some(p) if p.exists() => read_all(p)?,
            _ => Vec::new(),
        };
        Ok(Self {
            path,
            max_age: Duration::seconds(DEFAULT_MAX_AGE_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_max_age(&mut self, age: Duration) {
        self.max_age = age;
    }

    pub fn set_max_entries(&mut self, n: usize) {
        self.max_entries = n;
    }

    /// Records `id` as seen. Returns `true` iff this call newly inserted it;
    /// a repeat `Mark` of the same id within `max_age`/capacity is a no-op
    /// that returns `false` (I2).
    pub fn mark(&self, id: impl Into<String>, project: impl Into<String>) -> Result<bool> {
        let id = id.into();
        let mut guard = self.entries.lock().unwrap();
        if guard.iter().any(|e| e.id == id) {
            return Ok(false);
        }
        guard.push(DedupEntry {
            id,
            project: project.into(),
            created_at: Utc::now(),
        });
        if guard.len() > self.max_entries {
            let cutoff = Utc::now() - self.max_age;
            guard.retain(|e| e.created_at >= cutoff);
            evict(&mut guard, self.max_entries);
        }
        self.persist(&guard)?;
        Ok(true)
    }

    pub fn seen(&self, id: &str) -> bool {
        self.entries.lock().unwrap().iter().any(|e| e.id == id)
    }

    /// Drops entries older than `max_age`. Returns the number removed.
    pub fn cleanup(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.max_age;
        let mut guard = self.entries.lock().unwrap();
        let before = guard.len();
        guard.retain(|e| e.created_at >= cutoff);
        let removed = before - guard.len();
        if removed > 0 {
            self.persist(&guard)?;
        }
        Ok(removed)
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn clear(&self) -> Result<()> {
        let mut guard = self.entries.lock().unwrap();
        guard.clear();
        self.persist(&guard)
    }

    fn persist(&self, entries: &[DedupEntry]) -> Result<()> {
        if let Some(path) = &self.path {
            atomic_write_json(path, entries)?;
        }
        Ok(())
    }
}

/// Oldest-first eviction once the cap is exceeded.
fn evict(entries: &mut Vec<DedupEntry>, max_entries: usize) {
    if entries.len() <= max_entries {
        return;
    }
    entries.sort_by_key(|e: &DedupEntry| e.created_at);
    let excess = entries.len() - max_entries;
    entries.drain(0..excess);
}

fn read_all(path: &Path) -> Result<Vec<DedupEntry>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[allow(dead_code)]
fn oldest_entry_at(entries: &[DedupEntry]) -> Option<DateTime<Utc>> {
    entries.iter().map(|e| e.created_at).min()
}
