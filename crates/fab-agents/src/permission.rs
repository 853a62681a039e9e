//! Permission / user-question manager (§4.C) — the human-or-LLM-in-the-loop
//! decision point. Mirrors the channel-vs-callback design note in spec §9:
//! the reply mechanism is a single-receiver oneshot with a background
//! timeout, not a polled flag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fab_core::error::{Error, Result};
use fab_core::types::{PermissionRequest, PermissionResponse};
use tokio::sync::oneshot;
use uuid::Uuid;

type PendingEntry = (PermissionRequest, oneshot::Sender<Option<PermissionResponse>>);

pub struct PermissionManager {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    timeout: Duration,
}

impl PermissionManager {
    /// `timeout` defaults to 5 minutes per spec §4.C.
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    /// Register `req`, returning its id and a single-use reply receiver.
    /// A background timeout fires exactly one `None` send if nobody calls
    /// [`respond`](Self::respond) first — exactly one value is ever read.
    pub fn add(
        self: &Arc<Self>,
        req: PermissionRequest,
    ) -> (Uuid, oneshot::Receiver<Option<PermissionResponse>>) {
        let id = req.id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, (req, tx));

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.timeout).await;
            if let Some((_, tx)) = this.pending.lock().unwrap().remove(&id) {
                let _ = tx.send(None);
            }
        });

        (id, rx)
    }

    /// Deliver a response. `NotFound` means the id was already responded
    /// to, already timed out, or never registered.
    pub fn respond(&self, id: Uuid, resp: PermissionResponse) -> Result<()> {
        match self.pending.lock().unwrap().remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(Some(resp));
                Ok(())
            }
            None => Err(Error::NotFound(format!("permission request {id}"))),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<PermissionRequest> {
        self.pending.lock().unwrap().get(&id).map(|(r, _)| r.clone())
    }

    pub fn list(&self) -> Vec<PermissionRequest> {
        self.pending
            .lock()
            .unwrap()
            .values()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn list_for_project(&self, project: &str) -> Vec<PermissionRequest> {
        self.pending
            .lock()
            .unwrap()
            .values()
            .filter(|(r, _)| r.project == project)
            .map(|(r, _)| r.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(project: &str) -> PermissionRequest {
        PermissionRequest {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            project: project.into(),
            tool_name: "bash".into(),
            tool_input: serde_json::json!({"cmd": "ls"}),
            tool_use_id: None,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn add_then_respond_delivers_value_and_clears_entry() {
        let mgr = PermissionManager::new(Duration::from_secs(300));
        let req = request("p");
        let (id, rx) = mgr.add(req);
        mgr.respond(
            id,
            PermissionResponse {
                behavior: fab_core::types::PermissionBehavior::Allow,
                message: None,
            },
        )
        .unwrap();
        let resp = rx.await.unwrap();
        assert!(resp.is_some());
        assert!(mgr.get(id).is_none());
    }

    #[tokio::test]
    async fn timeout_closes_channel_with_none() {
        let mgr = PermissionManager::new(Duration::from_millis(10));
        let req = request("p");
        let (id, rx) = mgr.add(req);
        let resp = rx.await.unwrap();
        assert!(resp.is_none());
        assert!(mgr.get(id).is_none());
    }

    #[tokio::test]
    async fn respond_to_unknown_id_errors() {
        let mgr = PermissionManager::new(Duration::from_secs(300));
        let err = mgr
            .respond(
                Uuid::new_v4(),
                PermissionResponse {
                    behavior: fab_core::types::PermissionBehavior::Deny,
                    message: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn list_for_project_filters_by_project() {
        let mgr = PermissionManager::new(Duration::from_secs(300));
        mgr.add(request("a"));
        mgr.add(request("b"));
        assert_eq!(mgr.list_for_project("a").len(), 1);
        assert_eq!(mgr.list().len(), 2);
    }
}
