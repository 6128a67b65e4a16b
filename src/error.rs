//! Error types for the OpenClaw core.

use std::path::PathBuf;
use std::time::Duration;

/// Machine-readable error codes carried on the wire (`res.error.code`).
///
/// Every error surfaced to a client maps to exactly one of these tags plus a
/// human-readable message. Internal stack traces are logged, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    UnknownMethod,
    Unauthorized,
    UnauthorizedRole,
    MissingScope,
    ProtocolVersion,
    PayloadTooLarge,
    RateLimited,
    Timeout,
    ContextOverflow,
    NotFound,
    Conflict,
    LockTimeout,
    CorruptStore,
    Internal,
}

impl ErrorCode {
    /// The stable string form used in wire frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid-request",
            ErrorCode::UnknownMethod => "unknown-method",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::UnauthorizedRole => "unauthorized-role",
            ErrorCode::MissingScope => "missing-scope",
            ErrorCode::ProtocolVersion => "protocol-version",
            ErrorCode::PayloadTooLarge => "payload-too-large",
            ErrorCode::RateLimited => "rate-limited",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ContextOverflow => "context-overflow",
            ErrorCode::NotFound => "not-found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::LockTimeout => "lock-timeout",
            ErrorCode::CorruptStore => "corrupt-store",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable-store errors (session store, cron store).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Timed out acquiring lock for {path} after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Store file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            StoreError::LockTimeout { .. } => ErrorCode::LockTimeout,
            StoreError::Corrupt { .. } => ErrorCode::CorruptStore,
            StoreError::Io(_) | StoreError::Serialization(_) => ErrorCode::Internal,
        }
    }
}

/// Command-lane dispatcher errors, reported through a task's ticket only.
#[derive(Debug, thiserror::Error)]
pub enum LaneError {
    #[error("Task on lane {lane} was dropped before running")]
    Cancelled { lane: String },

    #[error("Task on lane {lane} panicked: {reason}")]
    Panicked { lane: String, reason: String },
}

/// Cron scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("Cron job {id} not found")]
    UnknownJob { id: String },

    #[error("Invalid schedule: {reason}")]
    InvalidSchedule { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors surfaced by the external agent executor.
///
/// The core never retries these itself; they are recorded in job state or
/// mapped to wire codes and handed back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Agent authentication failed: {0}")]
    Auth(String),

    #[error("Agent rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Billing error: {0}")]
    Billing(String),

    #[error("Agent run timed out after {0:?}")]
    Timeout(Duration),

    #[error("Context overflow: {used} tokens used, {limit} allowed")]
    ContextOverflow { used: u64, limit: u64 },

    #[error("Agent run failed: {0}")]
    Failed(String),
}

impl ExecutorError {
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            ExecutorError::Auth(_) => ErrorCode::Unauthorized,
            ExecutorError::RateLimited { .. } => ErrorCode::RateLimited,
            ExecutorError::Timeout(_) => ErrorCode::Timeout,
            ExecutorError::ContextOverflow { .. } => ErrorCode::ContextOverflow,
            ExecutorError::Billing(_) | ExecutorError::Failed(_) => ErrorCode::Internal,
        }
    }
}

/// Top-level error type for the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lane error: {0}")]
    Lane(#[from] LaneError),

    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Gateway error [{code}]: {message}")]
    Gateway { code: ErrorCode, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the core.
pub type Result<T> = std::result::Result<T, Error>;
