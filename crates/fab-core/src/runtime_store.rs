//! Agent runtime store — pretty-printed JSON array of [`AgentRuntime`],
//! atomically persisted so the daemon can reconnect after a restart.
//!
//! Writes are atomic: marshal -> write `<path>.tmp` -> rename -> on rename
//! failure, unlink the temp file. Reads of a missing file yield an empty
//! list. Grounded in the teacher's `DaemonLockfile::acquire` exclusive-create
//! technique (`at-core/src/lockfile.rs`), generalized from create-only to a
//! full-list rewrite.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AgentKind, AgentRuntime, AgentState};

pub struct RuntimeStore {
    path: Option<PathBuf>,
    agents: Mutex<Vec<AgentRuntime>>,
}

impl RuntimeStore {
    /// `path = None` runs the store purely in memory (useful for tests).
    pub fn new(path: Option<PathBuf>) -> Result<Self> {
        let agents = match &path {
            Some(p) if p.exists() => read_all(p)?,
            _ => Vec::new(),
        };
        Ok(Self {
            path,
            agents: Mutex::new(agents),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append or overwrite by id.
    pub fn upsert(&self, agent: AgentRuntime) -> Result<()> {
        let mut guard = self.agents.lock().unwrap();
        match guard.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent,
            None => guard.push(agent),
        }
        self.persist(&guard)
    }

    /// Idempotent: removing a missing id is not an error.
    pub fn remove(&self, id: Uuid) -> Result<()> {
        let mut guard = self.agents.lock().unwrap();
        guard.retain(|a| a.id != id);
        self.persist(&guard)
    }

    pub fn get(&self, id: Uuid) -> Result<AgentRuntime> {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<AgentRuntime> {
        self.agents.lock().unwrap().clone()
    }

    pub fn list_by_project(&self, project: &str) -> Vec<AgentRuntime> {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.project == project)
            .cloned()
            .collect()
    }

    pub fn list_by_kind(&self, kind: AgentKind) -> Vec<AgentRuntime> {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }

    pub fn update_thread_id(&self, id: Uuid, thread_id: impl Into<String>) -> Result<()> {
        let mut guard = self.agents.lock().unwrap();
        let agent = guard
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        agent.thread_id = Some(thread_id.into());
        agent.last_update = chrono::Utc::now();
        self.persist(&guard)
    }

    /// Set by the claim handler so the UI reflects the ticket an agent is
    /// working (§4.I).
    pub fn update_task(&self, id: Uuid, task: Option<String>) -> Result<()> {
        let mut guard = self.agents.lock().unwrap();
        let agent = guard
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        agent.task = task;
        agent.last_update = chrono::Utc::now();
        self.persist(&guard)
    }

    pub fn update_state(&self, id: Uuid, state: AgentState) -> Result<()> {
        let mut guard = self.agents.lock().unwrap();
        let agent = guard
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        agent.last_state = state;
        agent.last_update = chrono::Utc::now();
        self.persist(&guard)
    }

    pub fn clear(&self) -> Result<()> {
        let mut guard = self.agents.lock().unwrap();
        guard.clear();
        self.persist(&guard)
    }

    fn persist(&self, agents: &[AgentRuntime]) -> Result<()> {
        if let Some(path) = &self.path {
            atomic_write_json(path, agents)?;
        }
        Ok(())
    }
}

fn read_all(path: &Path) -> Result<Vec<AgentRuntime>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// write `<path>.tmp` -> `sync_all` -> `rename`; on rename failure, unlink
/// the temp file. Directory is created first.
pub(crate) fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let text = serde_json::to_string_pretty(value)?;
    let tmp_path = tmp_path_for(path);
    let file = std::fs::File::create(&tmp_path)?;
    use std::io::Write;
    {
        let mut file = file;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
    }
    match std::fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(Error::Io(e))
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(project: &str) -> AgentRuntime {
        AgentRuntime::new(project, AgentKind::Coding, "claude")
    }

    #[test]
    fn missing_file_yields_empty_list_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agents.json");
        let store = RuntimeStore::new(Some(path.clone())).unwrap();
        assert!(store.list().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn first_upsert_creates_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agents.json");
        let store = RuntimeStore::new(Some(path.clone())).unwrap();
        store.upsert(agent("p1")).unwrap();
        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn upsert_overwrites_by_id() {
        let store = RuntimeStore::new(None).unwrap();
        let mut a = agent("p1");
        store.upsert(a.clone()).unwrap();
        a.last_state = AgentState::Idle;
        store.upsert(a.clone()).unwrap();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get(a.id).unwrap().last_state, AgentState::Idle);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = RuntimeStore::new(None).unwrap();
        let a = agent("p1");
        store.upsert(a.clone()).unwrap();
        store.remove(a.id).unwrap();
        store.remove(a.id).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn list_by_project_and_kind_filter_correctly() {
        let store = RuntimeStore::new(None).unwrap();
        store.upsert(agent("p1")).unwrap();
        store.upsert(agent("p2")).unwrap();
        assert_eq!(store.list_by_project("p1").len(), 1);
        assert_eq!(store.list_by_kind(AgentKind::Coding).len(), 2);
    }

    #[test]
    fn reopen_after_crash_between_upserts_reads_consistent_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        {
            let store = RuntimeStore::new(Some(path.clone())).unwrap();
            store.upsert(agent("p1")).unwrap();
            store.upsert(agent("p2")).unwrap();
        }
        assert!(!tmp_path_for(&path).exists());
        let text = std::fs::read_to_string(&path).unwrap();
        let _: Vec<AgentRuntime> = serde_json::from_str(&text).unwrap();

        let reopened = RuntimeStore::new(Some(path)).unwrap();
        assert_eq!(reopened.list().len(), 2);
    }
}
