//! Structured logging setup for the fab daemon and its CLI — human-readable
//! output for terminals, JSON output for log aggregators.

pub mod logging;
