//! IPC-facing layer: the wire protocol, event bus, webhook server, comment
//! poller, and request dispatcher (§4.E, §4.F, §4.G, §4.I).
//!
//! The IPC transport itself — framing, connection lifecycle — is an
//! external collaborator (spec.md §1); this crate only defines the
//! already-decoded typed shapes and the handlers that act on them.

pub mod dispatch;
pub mod event_bus;
pub mod poller;
pub mod protocol;
pub mod webhook;
