//! Hierarchical session keys.
//!
//! A session key is a colon-delimited identifier and the single
//! cross-cutting identity of the runtime. Canonical forms:
//!
//! - `agent:{agentId}:main`
//! - `agent:{agentId}:{channel}:{chatType}:{peerId}`
//! - either of the above with a `:thread:{threadId}` suffix
//! - `cron:{jobId}` / `cron:{jobId}:run:{uuid}` for isolated cron runs
//!
//! Equality is string equality after trimming.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A trimmed, colon-delimited session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wrap a raw key string, trimming surrounding whitespace.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    /// The main session of an agent: `agent:{agentId}:main`.
    pub fn main(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main"))
    }

    /// A chat-scoped session: `agent:{agentId}:{channel}:{chatType}:{peerId}`.
    pub fn chat(agent_id: &str, channel: &str, chat_type: &str, peer_id: &str) -> Self {
        Self(format!("agent:{agent_id}:{channel}:{chat_type}:{peer_id}"))
    }

    /// The persistent session of a cron job: `cron:{jobId}`.
    pub fn cron_job(job_id: &str) -> Self {
        Self(format!("cron:{job_id}"))
    }

    /// A fresh isolated-run key: `cron:{jobId}:run:{uuid}`.
    pub fn isolated_run(job_id: &str) -> Self {
        Self(format!("cron:{job_id}:run:{}", Uuid::new_v4()))
    }

    /// Append a `:thread:{threadId}` suffix.
    pub fn with_thread(&self, thread_id: &str) -> Self {
        Self(format!("{}:thread:{thread_id}", self.0))
    }

    /// Whether this key belongs to the cron namespace (ephemeral candidates).
    pub fn is_cron(&self) -> bool {
        self.0.starts_with("cron:")
    }

    /// Whether this is an agent's main session.
    pub fn is_main(&self) -> bool {
        self.0.starts_with("agent:") && self.0.ends_with(":main")
    }

    /// The agent id segment, when this is an `agent:*` key.
    pub fn agent_id(&self) -> Option<&str> {
        let rest = self.0.strip_prefix("agent:")?;
        let end = rest.find(':')?;
        Some(&rest[..end])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}
