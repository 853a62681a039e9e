//! Domain error kinds shared across the supervisor's components.
//!
//! Every handler maps its failures onto one of these variants rather than a
//! component-specific error type, so the dispatcher can uniformly turn any
//! `Error` into an `errorResponse` string (see `fab-bridge::dispatch`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("cannot act on terminal agent: {0}")]
    Terminal(String),

    #[error("legacy config format detected")]
    LegacyFormat,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("toml parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("toml serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
