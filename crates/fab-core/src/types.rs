//! Data model shared by the registry, runtime stores, and dispatcher.
//!
//! Types here are plain data — persistence and validation live in the
//! modules that own each type (`registry`, `runtime_store`, `dedup_store`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// IssueBackend / PermissionsChecker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueBackend {
    Tk,
    Github,
    Gh,
    Linear,
}

impl std::str::FromStr for IssueBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tk" => Ok(IssueBackend::Tk),
            "github" => Ok(IssueBackend::Github),
            "gh" => Ok(IssueBackend::Gh),
            "linear" => Ok(IssueBackend::Linear),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for IssueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IssueBackend::Tk => "tk",
            IssueBackend::Github => "github",
            IssueBackend::Gh => "gh",
            IssueBackend::Linear => "linear",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionsChecker {
    Manual,
    Llm,
}

impl std::str::FromStr for PermissionsChecker {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(PermissionsChecker::Manual),
            "llm" => Ok(PermissionsChecker::Llm),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for PermissionsChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermissionsChecker::Manual => "manual",
            PermissionsChecker::Llm => "llm",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A registered git repository with associated agent policy.
///
/// `name` is stable and uniquely keys the projects map, the orchestrators
/// map, and the managers map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub remote_url: String,
    pub max_agents: u32,
    pub autostart: bool,
    pub issue_backend: IssueBackend,
    pub allowed_authors: Vec<String>,
    pub permissions_checker: PermissionsChecker,
    pub agent_backend: String,
    pub base_dir: String,
}

// ---------------------------------------------------------------------------
// AgentRuntime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Coding,
    Manager,
    Planner,
    Director,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Running,
    Idle,
    Done,
    Error,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Done | AgentState::Error)
    }
}

/// Owned by the runtime store. Upserted by the manager that owns the agent,
/// removed when the agent is deleted. Never cross-referenced by pointer —
/// only by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRuntime {
    pub id: Uuid,
    pub project: String,
    pub kind: AgentKind,
    pub backend: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub worktree_path: Option<String>,
    pub thread_id: Option<String>,
    pub last_state: AgentState,
    pub last_update: DateTime<Utc>,
    pub host_socket_path: Option<String>,
    pub stream_id: Option<String>,
    /// The ticket currently claimed by this agent, set by the claim handler
    /// so the UI reflects it (§4.I).
    pub task: Option<String>,
}

impl AgentRuntime {
    pub fn new(project: impl Into<String>, kind: AgentKind, backend: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            kind,
            backend: backend.into(),
            pid: None,
            started_at: now,
            worktree_path: None,
            thread_id: None,
            last_state: AgentState::Starting,
            last_update: now,
            host_socket_path: None,
            stream_id: None,
            task: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DedupEntry
// ---------------------------------------------------------------------------

/// Owned by the dedup store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub id: String,
    pub project: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ChatEntry
// ---------------------------------------------------------------------------

/// One line of the agent process's stream-json dialect, decoded down to the
/// fields the core actually needs. The dialect itself (prompt format, tool
/// schema) is an external collaborator's concern (spec §1); this is the
/// boundary type the heartbeat monitor and broadcaster consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StagedAction
// ---------------------------------------------------------------------------

/// Created by the orchestrator, consumed by approve/reject handlers. Lives
/// only in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedAction {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub project: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PermissionRequest / UserQuestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub project: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub tool_use_id: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub behavior: PermissionBehavior,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

pub type UserQuestion = PermissionRequest;

// ---------------------------------------------------------------------------
// IssueEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueEventType {
    Comment,
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEvent {
    #[serde(rename = "type")]
    pub event_type: IssueEventType,
    pub source: String,
    pub project: String,
    pub issue_id: String,
    pub comment_id: Option<String>,
    pub author: String,
    pub body: String,
    pub title: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl IssueEvent {
    /// `source:issue_id:comment_id` for comments, else
    /// `source:issue_id:type:timestamp_ns`.
    pub fn dedup_id(&self) -> String {
        match (&self.event_type, &self.comment_id) {
            (IssueEventType::Comment, Some(comment_id)) => {
                format!("{}:{}:{}", self.source, self.issue_id, comment_id)
            }
            _ => {
                let type_str = match self.event_type {
                    IssueEventType::Comment => "comment",
                    IssueEventType::Created => "created",
                    IssueEventType::Updated => "updated",
                };
                format!(
                    "{}:{}:{}:{}",
                    self.source,
                    self.issue_id,
                    type_str,
                    self.timestamp.timestamp_nanos_opt().unwrap_or_default()
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_dedup_id_uses_comment_id() {
        let ev = IssueEvent {
            event_type: IssueEventType::Comment,
            source: "github".into(),
            project: "p".into(),
            issue_id: "123".into(),
            comment_id: Some("c1".into()),
            author: "alice".into(),
            body: "hi".into(),
            title: None,
            timestamp: Utc::now(),
        };
        assert_eq!(ev.dedup_id(), "github:123:c1");
    }

    #[test]
    fn created_dedup_id_uses_type_and_timestamp() {
        let ts = Utc::now();
        let ev = IssueEvent {
            event_type: IssueEventType::Created,
            source: "github".into(),
            project: "p".into(),
            issue_id: "123".into(),
            comment_id: None,
            author: "alice".into(),
            body: "hi".into(),
            title: Some("t".into()),
            timestamp: ts,
        };
        assert_eq!(
            ev.dedup_id(),
            format!("github:123:created:{}", ts.timestamp_nanos_opt().unwrap())
        );
    }

    #[test]
    fn issue_backend_parses_case_insensitively() {
        assert_eq!(
            "GITHUB".parse::<IssueBackend>().unwrap(),
            IssueBackend::Github
        );
    }

    #[test]
    fn agent_state_terminal() {
        assert!(AgentState::Done.is_terminal());
        assert!(AgentState::Error.is_terminal());
        assert!(!AgentState::Running.is_terminal());
    }
}
