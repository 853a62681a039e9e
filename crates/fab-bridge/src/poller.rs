//! Comment poller (§4.F) — on each tick, snapshot running orchestrators'
//! active claims and pull new comments from each project's collaborative
//! backend. Mirrors the teacher's orchestrator-snapshot-then-release
//! pattern (`at-agents/src/orchestrator.rs`'s `start_cleanup_task`: lock,
//! clone, release, operate) rather than holding any lock across the
//! network call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fab_agents::heartbeat::AgentHost;
use fab_agents::lifecycle::OrchestratorTable;
use fab_agents::manager::AgentManager;
use fab_core::dedup_store::DedupStore;
use fab_integrations::backend::CollaborativeBackend;

const PER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CommentPoller {
    orchestrators: Arc<OrchestratorTable>,
    agent_manager: Arc<AgentManager>,
    dedup: Arc<DedupStore>,
    backends: HashMap<String, Arc<dyn CollaborativeBackend>>,
    claim_started_at: Mutex<HashMap<String, DateTime<Utc>>>,
    interval: Duration,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CommentPoller {
    /// `interval` defaults to 10 s per §4.F.
    pub fn new(
        orchestrators: Arc<OrchestratorTable>,
        agent_manager: Arc<AgentManager>,
        dedup: Arc<DedupStore>,
        backends: HashMap<String, Arc<dyn CollaborativeBackend>>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrators,
            agent_manager,
            dedup,
            backends,
            claim_started_at: Mutex::new(HashMap::new()),
            interval,
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut task_guard = self.task.lock().unwrap();
        if task_guard.is_some() {
            return;
        }
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.lock().unwrap() = Some(tx);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => this.sweep().await,
                    _ = &mut rx => break,
                }
            }
        });
        *task_guard = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn sweep(&self) {
        let names = self.orchestrators.names();
        let mut still_active_keys = HashSet::new();

        for name in names {
            let Some(orch) = self.orchestrators.get(&name) else {
                continue;
            };
            if !orch.is_running() {
                continue;
            }
            let Some(backend) = self.backends.get(&name) else {
                continue;
            };

            for (issue, agent_id) in orch.claims.active() {
                let key = format!("{name}:{issue}");
                still_active_keys.insert(key.clone());
                let since = {
                    let mut guard = self.claim_started_at.lock().unwrap();
                    *guard.entry(key.clone()).or_insert_with(Utc::now)
                };

                let comments = match tokio::time::timeout(
                    PER_CALL_TIMEOUT,
                    backend.list_comments(&issue, since),
                )
                .await
                {
                    Ok(Ok(comments)) => comments,
                    Ok(Err(err)) => {
                        tracing::warn!(project = %name, issue = %issue, %err, "comment poll failed");
                        continue;
                    }
                    Err(_) => {
                        tracing::warn!(project = %name, issue = %issue, "comment poll timed out");
                        continue;
                    }
                };

                for comment in comments {
                    let dedup_id = format!("comment:{name}:{issue}:{}", comment.id);
                    match self.dedup.mark(&dedup_id, &name) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(err) => tracing::warn!(%err, "dedup mark failed, delivering anyway"),
                    }
                    let message = format!(
                        "New comment on issue #{issue} from {}:\n\n{}",
                        comment.author, comment.body
                    );
                    if let Err(err) = self.agent_manager.send_message(agent_id, &message).await {
                        tracing::warn!(agent = %agent_id, %err, "failed to deliver comment to claim-holding agent");
                    }
                }
            }
        }

        self.claim_started_at
            .lock()
            .unwrap()
            .retain(|k, _| still_active_keys.contains(k));
    }

    /// Drops a claim's start-time immediately rather than waiting for the
    /// next sweep's garbage collection (§4.F's `ClearClaimTime`).
    pub fn clear_claim_time(&self, project: &str, issue: &str) {
        self.claim_started_at
            .lock()
            .unwrap()
            .remove(&format!("{project}:{issue}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fab_agents::manager::AgentManager;
    use fab_core::registry::ProjectRegistry;
    use fab_core::runtime_store::RuntimeStore;
    use fab_integrations::backend::{Backend, Comment};
    use tempfile::tempdir;

    struct MockBackend {
        comments: Mutex<Vec<Comment>>,
    }

    impl Backend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }
    }

    #[async_trait]
    impl CollaborativeBackend for MockBackend {
        async fn list_comments(
            &self,
            _issue_id: &str,
            _since: DateTime<Utc>,
        ) -> fab_core::error::Result<Vec<Comment>> {
            Ok(self.comments.lock().unwrap().clone())
        }
    }

    fn registry_with_autostart_project(dir: &std::path::Path) -> ProjectRegistry {
        let registry = ProjectRegistry::new_with_path(dir.join("config.toml")).unwrap();
        registry
            .add("git@example.com:x/y.git", None, 0, true, "claude")
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn delivers_new_comment_once_to_claim_holder() {
        let dir = tempdir().unwrap();
        let registry = registry_with_autostart_project(dir.path());
        let store = Arc::new(RuntimeStore::new(None).unwrap());
        let agent_manager = AgentManager::new(store);
        let orchestrators = Arc::new(OrchestratorTable::new(agent_manager.clone()));
        orchestrators.start_autostart(&registry);
        let orch = orchestrators.get("y").unwrap();
        let agent_id = uuid::Uuid::new_v4();
        orch.claims.claim("ISSUE-1", agent_id).unwrap();

        let mut backends: HashMap<String, Arc<dyn CollaborativeBackend>> = HashMap::new();
        backends.insert(
            "y".into(),
            Arc::new(MockBackend {
                comments: Mutex::new(vec![Comment {
                    id: "c1".into(),
                    author: "alice".into(),
                    body: "hi".into(),
                    created_at: Utc::now(),
                }]),
            }),
        );

        let dedup = Arc::new(DedupStore::new(None).unwrap());
        let poller = CommentPoller::new(
            orchestrators,
            agent_manager,
            dedup.clone(),
            backends,
            Duration::from_secs(10),
        );

        poller.sweep().await;
        poller.sweep().await;

        assert!(dedup.seen("comment:y:ISSUE-1:c1"));
    }

    #[tokio::test]
    async fn projects_without_a_backend_are_skipped() {
        let dir = tempdir().unwrap();
        let registry = registry_with_autostart_project(dir.path());
        let store = Arc::new(RuntimeStore::new(None).unwrap());
        let agent_manager = AgentManager::new(store);
        let orchestrators = Arc::new(OrchestratorTable::new(agent_manager.clone()));
        orchestrators.start_autostart(&registry);

        let dedup = Arc::new(DedupStore::new(None).unwrap());
        let poller = CommentPoller::new(
            orchestrators,
            agent_manager,
            dedup,
            HashMap::new(),
            Duration::from_secs(10),
        );
        poller.sweep().await;
    }
}
