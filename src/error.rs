//! Top-level error types for the daemon.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading/validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Database connection and operation errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to PostgreSQL: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(String),

    #[error("lost claim race for {id}")]
    LostClaim { id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Plan parsing/validation errors (§4.2).
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("{path}:{line}: {message}")]
    Parse {
        path: String,
        line: u32,
        message: String,
    },

    #[error("plan executable missing: {0}")]
    MissingExecutable(String),

    #[error("no such file: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crontab parsing errors (§4.1).
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule {source:?}: {reason}")]
    InvalidSchedule { source: String, reason: String },
}

/// Control protocol errors: malformed UDP datagrams or control-channel frames (§4.7, §6).
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("bad magic number")]
    BadMagic,

    #[error("CRC32 mismatch")]
    BadCrc,

    #[error("truncated packet")]
    Truncated,

    #[error("unknown command {0}")]
    UnknownCommand(u16),

    #[error("malformed control-channel frame: {0}")]
    MalformedFrame(String),

    #[error("permission denied: peer uid {0} is not root")]
    PermissionDenied(u32),
}

/// Spawn-server interface errors (§1: out of scope beyond this interface).
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("spawn request failed: {0}")]
    Request(String),

    #[error("spawn service unavailable: {0}")]
    Unavailable(String),
}

/// Translation-server interface errors (§1: out of scope beyond this interface).
#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error("translation request failed: {0}")]
    Request(String),

    #[error("unknown translation token: {0}")]
    UnknownToken(String),
}
