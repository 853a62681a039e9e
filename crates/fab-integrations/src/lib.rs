//! Issue-tracker backend interfaces, webhook payload parsers, and the
//! LLM-delegated permission authorizer seam.
//!
//! The concrete GitHub/Linear HTTP clients and LLM provider client are
//! external collaborators (see the crate's scope note in the workspace's
//! top-level spec) — this crate only defines the `Backend`/
//! `CollaborativeBackend`/`Authorizer` seams the supervisor depends on, plus
//! the payload-to-`IssueEvent` mapping the webhook server needs to stay
//! provider-agnostic past the HTTP boundary.

pub mod backend;
pub mod llm_auth;
pub mod parsers;
