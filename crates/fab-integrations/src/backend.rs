//! Issue-tracker backend interfaces.
//!
//! The supervisor never talks to GitHub/Linear/a local file store directly —
//! it only depends on these two traits. Concrete implementations (HTTP
//! clients, OAuth flows) are external collaborators per the system's scope
//! and are not part of this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fab_core::error::Result;

/// A single comment on a tracked issue, as returned by a collaborative
/// backend's comment listing.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Minimal identity every issue backend exposes.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
}

/// Backends that support polling for new comments on an issue — GitHub and
/// Linear do, a local file-based backend does not. The comment poller
/// (`fab_bridge::poller`) only drives projects whose backend implements
/// this trait.
#[async_trait]
pub trait CollaborativeBackend: Backend {
    /// List comments posted on `issue_id` at or after `since`.
    async fn list_comments(&self, issue_id: &str, since: DateTime<Utc>) -> Result<Vec<Comment>>;
}
