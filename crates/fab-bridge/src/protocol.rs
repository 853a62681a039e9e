//! Wire-level request/response envelope and streaming event types (§6, §9).
//!
//! The IPC transport — framing, connection lifecycle — is an external
//! collaborator; this module only defines the already-decoded typed shapes
//! [`crate::dispatch::Dispatcher`] switches on and [`crate::event_bus::EventBus`]
//! fans out.

use fab_core::error::Error;
use fab_core::types::PermissionRequest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Uuid,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Response {
    pub fn success(req: &Request, payload: serde_json::Value) -> Self {
        Self {
            kind: req.kind.clone(),
            id: req.id,
            success: true,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn success_empty(req: &Request) -> Self {
        Self {
            kind: req.kind.clone(),
            id: req.id,
            success: true,
            error: None,
            payload: None,
        }
    }

    /// An "expected" failure reply — not-found, bad payload, conflict.
    pub fn error(req: &Request, message: impl Into<String>) -> Self {
        Self {
            kind: req.kind.clone(),
            id: req.id,
            success: false,
            error: Some(message.into()),
            payload: None,
        }
    }

    /// The `agent.done` merge-conflict path: `success=false` *and* a
    /// structured payload so the client agent can self-resolve.
    pub fn error_with_payload(
        req: &Request,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: req.kind.clone(),
            id: req.id,
            success: false,
            error: Some(message.into()),
            payload: Some(payload),
        }
    }
}

/// Decode `value` into `T`. `serde_json::Value` already covers both the
/// "already-a-map" and "arbitrary JSON-marshalable" shapes spec §9 asks a
/// dynamic-payload helper to handle, so this is a single mapped
/// `from_value` call rather than a hand-rolled reflection layer.
pub fn decode_payload<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, Error> {
    serde_json::from_value(value.clone()).map_err(|e| Error::Invalid(format!("bad payload: {e}")))
}

/// Streaming events delivered over the attach channel (§4.G), distinguished
/// by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Created {
        project: String,
        payload: serde_json::Value,
    },
    State {
        project: String,
        agent_id: Option<Uuid>,
        payload: serde_json::Value,
    },
    Info {
        project: String,
        message: String,
    },
    Deleted {
        project: String,
        payload: serde_json::Value,
    },
    ChatEntry {
        project: String,
        agent_id: Uuid,
        payload: serde_json::Value,
    },
    ManagerState {
        project: String,
        agent_id: Uuid,
        payload: serde_json::Value,
    },
    ManagerChatEntry {
        project: String,
        agent_id: Uuid,
        payload: serde_json::Value,
    },
    PlannerEvent {
        project: String,
        kind: String,
        payload: serde_json::Value,
    },
    PermissionRequest {
        project: String,
        request: PermissionRequest,
    },
    UserQuestion {
        project: String,
        request: PermissionRequest,
    },
    Intervention {
        project: String,
        message: String,
    },
}

impl StreamEvent {
    pub fn project(&self) -> &str {
        match self {
            StreamEvent::Created { project, .. }
            | StreamEvent::State { project, .. }
            | StreamEvent::Info { project, .. }
            | StreamEvent::Deleted { project, .. }
            | StreamEvent::ChatEntry { project, .. }
            | StreamEvent::ManagerState { project, .. }
            | StreamEvent::ManagerChatEntry { project, .. }
            | StreamEvent::PlannerEvent { project, .. }
            | StreamEvent::PermissionRequest { project, .. }
            | StreamEvent::UserQuestion { project, .. }
            | StreamEvent::Intervention { project, .. } => project,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_payload_maps_shape_error_to_invalid() {
        let v = serde_json::json!({"foo": "bar"});
        let err = decode_payload::<Uuid>(&v).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn response_error_carries_no_payload_by_default() {
        let req = Request {
            kind: "agent.claim".into(),
            id: Uuid::new_v4(),
            payload: serde_json::Value::Null,
        };
        let resp = Response::error(&req, "not found");
        assert!(!resp.success);
        assert!(resp.payload.is_none());
    }

    #[test]
    fn stream_event_project_reads_every_variant() {
        let ev = StreamEvent::Info {
            project: "p".into(),
            message: "hi".into(),
        };
        assert_eq!(ev.project(), "p");
    }
}
