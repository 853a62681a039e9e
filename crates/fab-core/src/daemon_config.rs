//! Daemon-level settings, distinct from the per-project registry file.
//!
//! Grounded in the teacher's `Config` section-struct pattern
//! (`at-core/src/config.rs`): each field has a `#[serde(default = "...")]`
//! free function so the file can be partial or absent entirely.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_webhook_bind_addr")]
    pub webhook_bind_addr: String,
    #[serde(default = "default_webhook_prefix")]
    pub webhook_prefix: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_heartbeat_check_interval_secs")]
    pub heartbeat_check_interval_secs: u64,
    #[serde(default = "default_heartbeat_warn_timeout_secs")]
    pub heartbeat_warn_timeout_secs: u64,
    #[serde(default = "default_heartbeat_kill_timeout_secs")]
    pub heartbeat_kill_timeout_secs: u64,
    #[serde(default = "default_permission_timeout_secs")]
    pub permission_timeout_secs: u64,
    #[serde(default = "default_comment_poll_interval_secs")]
    pub comment_poll_interval_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            webhook_bind_addr: default_webhook_bind_addr(),
            webhook_prefix: default_webhook_prefix(),
            webhook_secret: None,
            heartbeat_check_interval_secs: default_heartbeat_check_interval_secs(),
            heartbeat_warn_timeout_secs: default_heartbeat_warn_timeout_secs(),
            heartbeat_kill_timeout_secs: default_heartbeat_kill_timeout_secs(),
            permission_timeout_secs: default_permission_timeout_secs(),
            comment_poll_interval_secs: default_comment_poll_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            registry_path: default_registry_path(),
            runtime_dir: default_runtime_dir(),
        }
    }
}

impl DaemonConfig {
    /// Load from `~/.config/fab/daemon.toml`, tolerating a missing file by
    /// falling back to defaults (mirrors the teacher's `Config::load`).
    pub fn load() -> Result<Self> {
        Self::load_from(default_path())
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn runtime_dir_path(&self) -> PathBuf {
        expand_tilde(&self.runtime_dir)
    }

    pub fn registry_path_buf(&self) -> PathBuf {
        expand_tilde(&self.registry_path)
    }
}

fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(s)
    }
}

fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fab")
        .join("daemon.toml")
}

fn default_webhook_bind_addr() -> String {
    "127.0.0.1:8787".into()
}
fn default_webhook_prefix() -> String {
    "/webhooks".into()
}
fn default_heartbeat_check_interval_secs() -> u64 {
    30
}
fn default_heartbeat_warn_timeout_secs() -> u64 {
    120
}
fn default_heartbeat_kill_timeout_secs() -> u64 {
    240
}
fn default_permission_timeout_secs() -> u64 {
    300
}
fn default_comment_poll_interval_secs() -> u64 {
    10
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_registry_path() -> String {
    "~/.config/fab/config.toml".into()
}
fn default_runtime_dir() -> String {
    "~/.config/fab/run".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = DaemonConfig::load_from("/nonexistent/path/daemon.toml").unwrap();
        assert_eq!(cfg.webhook_prefix, "/webhooks");
        assert_eq!(cfg.permission_timeout_secs, 300);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        std::fs::write(&path, "heartbeat_check_interval_secs = 5\n").unwrap();
        let cfg = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(cfg.heartbeat_check_interval_secs, 5);
        assert_eq!(cfg.comment_poll_interval_secs, 10);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = DaemonConfig::default();
        let text = cfg.to_toml().unwrap();
        let parsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.webhook_bind_addr, cfg.webhook_bind_addr);
    }
}
