//! Agent manager — owns live [`AgentProcess`] handles and is the single
//! source of truth [`HeartbeatMonitor`](crate::heartbeat::HeartbeatMonitor)
//! binds its `send_message`/`stop_agent` to (§4.J). Forwards each decoded
//! `ChatEntry` to a caller-supplied sink so the supervisor can broadcast it
//! and feed the heartbeat monitor's `record_output`, without this crate
//! depending on the bridge layer.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use fab_core::error::{Error, Result};
use fab_core::runtime_store::RuntimeStore;
use fab_core::types::{AgentKind, AgentRuntime, AgentState, ChatEntry};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::heartbeat::AgentHost;
use crate::process::AgentProcess;

pub type ChatEntryCallback = Arc<dyn Fn(Uuid, &ChatEntry) + Send + Sync>;

/// Most recent history entries kept per agent for the permission handler's
/// context capture (§4.I: "up to 10 most recent history entries").
const HISTORY_CAP: usize = 10;

struct Managed {
    process: AgentProcess,
}

pub struct AgentManager {
    store: Arc<RuntimeStore>,
    // tokio's async-aware lock: `send_message` holds it across an `.await`
    // while writing to the child process's stdin.
    agents: RwLock<HashMap<Uuid, Managed>>,
    on_entry: StdRwLock<Option<ChatEntryCallback>>,
    history: StdRwLock<HashMap<Uuid, VecDeque<ChatEntry>>>,
}

impl AgentManager {
    pub fn new(store: Arc<RuntimeStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            agents: RwLock::new(HashMap::new()),
            on_entry: StdRwLock::new(None),
            history: StdRwLock::new(HashMap::new()),
        })
    }

    pub fn set_on_chat_entry(&self, cb: ChatEntryCallback) {
        *self.on_entry.write().unwrap() = Some(cb);
    }

    /// Spawn an agent process for `project`, persist its runtime record,
    /// and start forwarding its decoded `ChatEntry` stream.
    pub async fn start_agent(
        self: &Arc<Self>,
        project: &str,
        kind: AgentKind,
        backend: &str,
        command: &str,
        args: &[String],
        worktree: &Path,
    ) -> Result<Uuid> {
        let (process, mut rx) = AgentProcess::spawn(command, args, worktree)?;
        let mut runtime = AgentRuntime::new(project, kind, backend);
        runtime.pid = process.pid();
        runtime.worktree_path = Some(worktree.display().to_string());
        runtime.last_state = AgentState::Running;
        let id = runtime.id;
        self.store.upsert(runtime)?;
        self.agents.write().await.insert(id, Managed { process });

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                {
                    let mut history = this.history.write().unwrap();
                    let deque = history.entry(id).or_default();
                    deque.push_back(entry.clone());
                    if deque.len() > HISTORY_CAP {
                        deque.pop_front();
                    }
                }
                let cb = this.on_entry.read().unwrap().clone();
                if let Some(cb) = cb {
                    cb(id, &entry);
                }
                if let Err(err) = this.store.update_state(id, AgentState::Running) {
                    tracing::warn!(agent = %id, %err, "failed to persist agent runtime state");
                }
            }
        });

        Ok(id)
    }

    pub fn list_for_project(&self, project: &str) -> Vec<AgentRuntime> {
        self.store.list_by_project(project)
    }

    /// The project an agent belongs to, for callers (the supervisor's chat
    /// broadcast) that only have an id.
    pub fn project_of(&self, agent_id: Uuid) -> Option<String> {
        self.store.get(agent_id).ok().map(|a| a.project)
    }

    pub fn stop_all_for_project(&self, project: &str) -> Vec<Uuid> {
        self.store
            .list_by_project(project)
            .into_iter()
            .map(|a| a.id)
            .collect()
    }

    /// Up to the last [`HISTORY_CAP`] chat entries seen for `agent_id`,
    /// oldest first.
    pub fn recent_history(&self, agent_id: Uuid) -> Vec<ChatEntry> {
        self.history
            .read()
            .unwrap()
            .get(&agent_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records the ticket an agent is currently working, for the claim
    /// handler (§4.I).
    pub fn set_task(&self, agent_id: Uuid, task: Option<String>) -> Result<()> {
        self.store.update_task(agent_id, task)
    }

    pub fn describe(&self, agent_id: Uuid) -> Result<AgentRuntime> {
        self.store.get(agent_id)
    }

    /// Drops the live process handle (if any — `kill_on_drop` tears down the
    /// child) and erases the runtime record entirely, unlike `stop_agent`
    /// which only marks it `Done`.
    pub async fn delete_agent(&self, agent_id: Uuid) -> Result<()> {
        self.agents.write().await.remove(&agent_id);
        self.store.remove(agent_id)
    }

    /// Refuses to act on an already-terminal agent (§7's `Terminal` kind).
    pub async fn abort_agent(&self, agent_id: Uuid) -> Result<()> {
        let runtime = self.store.get(agent_id)?;
        if runtime.last_state.is_terminal() {
            return Err(Error::Terminal(agent_id.to_string()));
        }
        self.stop_agent(agent_id).await
    }

    pub fn mark_done(&self, agent_id: Uuid) -> Result<()> {
        self.store.update_state(agent_id, AgentState::Done)
    }

    pub fn mark_idle(&self, agent_id: Uuid) -> Result<()> {
        self.store.update_state(agent_id, AgentState::Idle)
    }
}

#[async_trait]
impl AgentHost for AgentManager {
    async fn send_message(&self, agent_id: Uuid, message: &str) -> Result<()> {
        let mut guard = self.agents.write().await;
        match guard.get_mut(&agent_id) {
            Some(managed) => managed.process.send(message).await,
            None => Err(Error::NotFound(format!("agent {agent_id}"))),
        }
    }

    async fn stop_agent(&self, agent_id: Uuid) -> Result<()> {
        let managed = self.agents.write().await.remove(&agent_id);
        if let Some(mut managed) = managed {
            managed.process.kill().await?;
        }
        self.store.update_state(agent_id, AgentState::Done)?;
        Ok(())
    }

    async fn active_agents(&self) -> Vec<Uuid> {
        self.agents.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_agent_persists_runtime_record() {
        let store = Arc::new(RuntimeStore::new(None).unwrap());
        let manager = AgentManager::new(store.clone());
        let id = manager
            .start_agent(
                "p1",
                AgentKind::Coding,
                "claude",
                "sh",
                &["-c".into(), "cat".into()],
                Path::new("."),
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).unwrap().project, "p1");
        assert_eq!(manager.active_agents().await, vec![id]);
    }

    #[test]
    fn set_task_persists_on_the_runtime_record() {
        let store = Arc::new(RuntimeStore::new(None).unwrap());
        let manager = AgentManager::new(store.clone());
        let runtime = AgentRuntime::new("p1", AgentKind::Coding, "claude");
        let id = runtime.id;
        store.upsert(runtime).unwrap();
        manager.set_task(id, Some("ISSUE-1".into())).unwrap();
        assert_eq!(store.get(id).unwrap().task, Some("ISSUE-1".into()));
    }

    #[test]
    fn recent_history_is_empty_for_unknown_agent() {
        let manager = AgentManager::new(Arc::new(RuntimeStore::new(None).unwrap()));
        assert!(manager.recent_history(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn project_of_resolves_a_known_agent() {
        let store = Arc::new(RuntimeStore::new(None).unwrap());
        let manager = AgentManager::new(store.clone());
        let runtime = AgentRuntime::new("p1", AgentKind::Coding, "claude");
        let id = runtime.id;
        store.upsert(runtime).unwrap();
        assert_eq!(manager.project_of(id).as_deref(), Some("p1"));
        assert_eq!(manager.project_of(Uuid::new_v4()), None);
    }

    #[tokio::test]
    async fn delete_agent_erases_the_runtime_record() {
        let store = Arc::new(RuntimeStore::new(None).unwrap());
        let manager = AgentManager::new(store.clone());
        let runtime = AgentRuntime::new("p1", AgentKind::Coding, "claude");
        let id = runtime.id;
        store.upsert(runtime).unwrap();
        manager.delete_agent(id).await.unwrap();
        assert!(store.get(id).is_err());
    }

    #[tokio::test]
    async fn abort_agent_rejects_an_already_terminal_agent() {
        let store = Arc::new(RuntimeStore::new(None).unwrap());
        let manager = AgentManager::new(store.clone());
        let mut runtime = AgentRuntime::new("p1", AgentKind::Coding, "claude");
        runtime.last_state = AgentState::Done;
        let id = runtime.id;
        store.upsert(runtime).unwrap();
        let err = manager.abort_agent(id).await.unwrap_err();
        assert!(matches!(err, Error::Terminal(_)));
    }

    #[test]
    fn mark_done_and_mark_idle_persist_state() {
        let store = Arc::new(RuntimeStore::new(None).unwrap());
        let manager = AgentManager::new(store.clone());
        let runtime = AgentRuntime::new("p1", AgentKind::Coding, "claude");
        let id = runtime.id;
        store.upsert(runtime).unwrap();
        manager.mark_idle(id).unwrap();
        assert_eq!(store.get(id).unwrap().last_state, AgentState::Idle);
        manager.mark_done(id).unwrap();
        assert_eq!(store.get(id).unwrap().last_state, AgentState::Done);
    }
}
