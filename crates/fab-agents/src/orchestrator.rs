//! Per-project task-assignment engine lifecycle (§4.H). Task-assignment
//! policy itself is an external collaborator; this module owns what spec
//! keeps in scope — the claim table, running flag, and start/stop
//! sequencing, grounded in the teacher's orchestrator module boundary
//! (`at-agents/src/orchestrator.rs`) without its Claude-specific internals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fab_core::types::Project;

use crate::claims::ClaimTable;
use crate::heartbeat::AgentHost;
use crate::manager::AgentManager;

pub struct ProjectOrchestrator {
    pub project: Project,
    pub claims: ClaimTable,
    running: AtomicBool,
    agent_manager: Arc<AgentManager>,
}

impl ProjectOrchestrator {
    pub fn new(project: Project, agent_manager: Arc<AgentManager>) -> Arc<Self> {
        Arc::new(Self {
            project,
            claims: ClaimTable::new(),
            running: AtomicBool::new(false),
            agent_manager,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Ceases new task assignment. If `preserve_agents` is false, every
    /// agent belonging to this project is stopped; otherwise they are left
    /// running for the external agent host (§4.H).
    pub async fn stop(&self, preserve_agents: bool) {
        self.running.store(false, Ordering::SeqCst);
        if preserve_agents {
            return;
        }
        for id in self.agent_manager.stop_all_for_project(&self.project.name) {
            if let Err(err) = self.agent_manager.stop_agent(id).await {
                tracing::warn!(agent = %id, %err, "failed to stop agent during orchestrator shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_core::runtime_store::RuntimeStore;
    use fab_core::types::{IssueBackend, PermissionsChecker};

    fn project() -> Project {
        Project {
            name: "p1".into(),
            remote_url: "git@example.com:x/y.git".into(),
            max_agents: 5,
            autostart: false,
            issue_backend: IssueBackend::Github,
            allowed_authors: Vec::new(),
            permissions_checker: PermissionsChecker::Manual,
            agent_backend: "claude".into(),
            base_dir: "/tmp".into(),
        }
    }

    #[tokio::test]
    async fn start_marks_running_and_stop_clears_it() {
        let manager = AgentManager::new(Arc::new(RuntimeStore::new(None).unwrap()));
        let orch = ProjectOrchestrator::new(project(), manager);
        assert!(!orch.is_running());
        orch.start();
        assert!(orch.is_running());
        orch.stop(true).await;
        assert!(!orch.is_running());
    }
}
