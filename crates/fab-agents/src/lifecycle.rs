//! `project → orchestrator` map (§4.H), one `RwLock` per the locking
//! discipline in spec §5 — handlers snapshot under a read-lock and release
//! it before performing slow per-entry operations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use fab_core::error::{Error, Result};
use fab_core::registry::ProjectRegistry;

use crate::manager::AgentManager;
use crate::orchestrator::ProjectOrchestrator;

pub struct OrchestratorTable {
    orchestrators: RwLock<HashMap<String, Arc<ProjectOrchestrator>>>,
    agent_manager: Arc<AgentManager>,
}

impl OrchestratorTable {
    pub fn new(agent_manager: Arc<AgentManager>) -> Self {
        Self {
            orchestrators: RwLock::new(HashMap::new()),
            agent_manager,
        }
    }

    /// If `project` already has a running orchestrator, return ok (§4.H).
    pub fn start_orchestrator(&self, registry: &ProjectRegistry, project: &str) -> Result<()> {
        {
            let guard = self.orchestrators.read().unwrap();
            if let Some(existing) = guard.get(project) {
                if existing.is_running() {
                    return Ok(());
                }
            }
        }
        let proj = registry
            .get(project)
            .ok_or_else(|| Error::NotFound(project.to_string()))?;
        let orch = ProjectOrchestrator::new(proj, self.agent_manager.clone());
        orch.start();
        self.orchestrators
            .write()
            .unwrap()
            .insert(project.to_string(), orch);
        Ok(())
    }

    /// Silently returns if `project` has no orchestrator.
    pub async fn stop_orchestrator(&self, project: &str, preserve_agents: bool) {
        let orch = self.orchestrators.write().unwrap().remove(project);
        if let Some(orch) = orch {
            orch.stop(preserve_agents).await;
        }
    }

    pub fn start_autostart(&self, registry: &ProjectRegistry) {
        for project in registry.list() {
            if project.autostart {
                if let Err(err) = self.start_orchestrator(registry, &project.name) {
                    tracing::warn!(project = %project.name, %err, "failed to autostart project");
                }
            }
        }
    }

    pub fn get(&self, project: &str) -> Option<Arc<ProjectOrchestrator>> {
        self.orchestrators.read().unwrap().get(project).cloned()
    }

    /// Snapshot of currently-registered project names, read-lock released
    /// before any per-entry operation (§5).
    pub fn names(&self) -> Vec<String> {
        self.orchestrators.read().unwrap().keys().cloned().collect()
    }

    /// Drains every orchestrator; `preserve_agents = !stop_host`. Returns
    /// `true` if the drain completed within `timeout` (§4.H, §5).
    pub async fn shutdown(&self, stop_host: bool, timeout: Duration) -> bool {
        let names = self.names();
        let preserve_agents = !stop_host;
        let drain = async {
            for name in names {
                self.stop_orchestrator(&name, preserve_agents).await;
            }
        };
        tokio::time::timeout(timeout, drain).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_core::runtime_store::RuntimeStore;
    use tempfile::tempdir;

    fn table() -> OrchestratorTable {
        let manager = AgentManager::new(Arc::new(RuntimeStore::new(None).unwrap()));
        OrchestratorTable::new(manager)
    }

    fn registry_with(dir: &std::path::Path) -> ProjectRegistry {
        let registry = ProjectRegistry::new_with_path(dir.join("config.toml")).unwrap();
        registry
            .add("git@example.com:x/y.git", None, 0, true, "claude")
            .unwrap();
        registry
    }

    #[test]
    fn starting_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let registry = registry_with(dir.path());
        let table = table();
        table.start_orchestrator(&registry, "y").unwrap();
        table.start_orchestrator(&registry, "y").unwrap();
        assert_eq!(table.names().len(), 1);
    }

    #[test]
    fn starting_unknown_project_errors() {
        let dir = tempdir().unwrap();
        let registry = registry_with(dir.path());
        let table = table();
        let err = table.start_orchestrator(&registry, "nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn stopping_unknown_project_is_silent() {
        let table = table();
        table.stop_orchestrator("nope", true).await;
    }

    #[test]
    fn start_autostart_starts_every_autostart_project() {
        let dir = tempdir().unwrap();
        let registry = registry_with(dir.path());
        let table = table();
        table.start_autostart(&registry);
        assert_eq!(table.names().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_all_orchestrators_within_timeout() {
        let dir = tempdir().unwrap();
        let registry = registry_with(dir.path());
        let table = table();
        table.start_autostart(&registry);
        let drained = table.shutdown(true, Duration::from_secs(5)).await;
        assert!(drained);
        assert!(table.names().is_empty());
    }
}
