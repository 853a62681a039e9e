//! Supervisor construction and wiring for the `fabd` binary (§4.J).
//!
//! Everything else — the registry, runtime/dedup stores, orchestrator
//! lifecycle, heartbeat monitor, webhook server, comment poller, and
//! request dispatcher — lives in `fab-core`, `fab-agents`, and
//! `fab-bridge`; this crate only assembles them and drives the top-level
//! event-processing loop.

pub mod supervisor;
