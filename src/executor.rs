//! Agent executor facade.
//!
//! The core never invokes a model itself. Everything that needs an agent
//! turn (heartbeats, isolated cron runs, gateway methods) goes through this
//! trait; the real implementation lives outside the core and the session
//! file remains the source of truth.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::session::{SessionKey, TokenUsage};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    Aborted,
}

/// Streaming deltas surfaced while a run is in flight.
///
/// Delivered on the lane's worker task; receivers must not block.
#[derive(Debug, Clone)]
pub enum RunDelta {
    Partial(String),
    Tool(Value),
    Reasoning(String),
}

/// One agent invocation.
pub struct RunRequest {
    pub session_id: Uuid,
    pub session_key: SessionKey,
    pub prompt: String,
    pub think_level: Option<String>,
    pub model: Option<String>,
    pub timeout: Option<Duration>,
    /// Optional sink for streaming deltas.
    pub deltas: Option<mpsc::UnboundedSender<RunDelta>>,
}

impl RunRequest {
    pub fn new(session_id: Uuid, session_key: SessionKey, prompt: impl Into<String>) -> Self {
        Self {
            session_id,
            session_key,
            prompt: prompt.into(),
            think_level: None,
            model: None,
            timeout: None,
            deltas: None,
        }
    }
}

/// The result of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub text: String,
    pub blocks: Vec<Value>,
    pub usage: TokenUsage,
    pub stop_reason: StopReason,
}

/// Interface to the external LLM-backed executor.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run one agent turn. Possibly long (seconds to minutes); bounded by
    /// `request.timeout` when set.
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, ExecutorError>;

    /// Summarize long session history down to fit the context window.
    async fn compact(&self, session_id: Uuid, min_reserve_tokens: u32)
    -> Result<(), ExecutorError>;

    /// Whether a run is currently in flight for this session.
    fn is_busy(&self, session_id: Uuid) -> bool;

    /// Append a follow-up to an in-flight run. Returns `false` when the
    /// session is idle.
    fn enqueue_follow_up(&self, session_id: Uuid, text: &str) -> bool;

    /// Wait until the session is idle. Returns `false` on timeout.
    async fn wait_for_idle(&self, session_id: Uuid, timeout: Duration) -> bool;
}

/// Placeholder used when the daemon is started without an agent backend.
/// Every run fails with a clear message; the gateway and stores still work.
pub struct UnconfiguredExecutor;

#[async_trait]
impl AgentExecutor for UnconfiguredExecutor {
    async fn run(&self, _request: RunRequest) -> Result<RunOutcome, ExecutorError> {
        Err(ExecutorError::Failed(
            "no agent executor configured".to_string(),
        ))
    }

    async fn compact(
        &self,
        _session_id: Uuid,
        _min_reserve_tokens: u32,
    ) -> Result<(), ExecutorError> {
        Err(ExecutorError::Failed(
            "no agent executor configured".to_string(),
        ))
    }

    fn is_busy(&self, _session_id: Uuid) -> bool {
        false
    }

    fn enqueue_follow_up(&self, _session_id: Uuid, _text: &str) -> bool {
        false
    }

    async fn wait_for_idle(&self, _session_id: Uuid, _timeout: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_executor_fails_runs_but_stays_idle() {
        let exec = UnconfiguredExecutor;
        let err = exec
            .run(RunRequest::new(
                Uuid::new_v4(),
                SessionKey::main("home"),
                "hello",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Failed(_)));
        assert!(!exec.is_busy(Uuid::new_v4()));
        assert!(exec.wait_for_idle(Uuid::new_v4(), Duration::from_millis(1)).await);
    }
}
