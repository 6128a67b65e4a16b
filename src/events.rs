//! Per-session system-event queues.
//!
//! Small text notes enqueued for an agent to process at its next heartbeat.
//! Each session's queue is bounded and drops consecutive duplicates; the
//! heartbeat runner is the only consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::session::SessionKey;
use crate::util::time::now_ms;

/// Maximum queued events per session; the oldest is evicted beyond this.
pub const MAX_QUEUED_EVENTS: usize = 20;

/// One queued note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub text: String,
    pub ts: i64,
}

#[derive(Default)]
struct PerSession {
    queue: VecDeque<SystemEvent>,
    last_text: Option<String>,
}

/// In-memory map of session key to bounded event queue.
#[derive(Default)]
pub struct SystemEventQueue {
    inner: Mutex<HashMap<SessionKey, PerSession>>,
}

impl SystemEventQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a note for a session. Returns `false` when the text was empty
    /// after trimming or a consecutive duplicate of the previous note.
    pub async fn enqueue(&self, key: &SessionKey, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        let mut inner = self.inner.lock().await;
        let slot = inner.entry(key.clone()).or_default();

        if slot.last_text.as_deref() == Some(text) {
            debug!(session = %key, "Dropped duplicate system event");
            return false;
        }

        slot.queue.push_back(SystemEvent {
            text: text.to_string(),
            ts: now_ms(),
        });
        if slot.queue.len() > MAX_QUEUED_EVENTS {
            slot.queue.pop_front();
        }
        slot.last_text = Some(text.to_string());
        true
    }

    /// Remove and return all queued events for a session.
    pub async fn drain(&self, key: &SessionKey) -> Vec<SystemEvent> {
        let mut inner = self.inner.lock().await;
        match inner.remove(key) {
            Some(slot) => slot.queue.into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Non-destructive view of a session's queued texts.
    pub async fn peek(&self, key: &SessionKey) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .get(key)
            .map(|slot| slot.queue.iter().map(|e| e.text.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of queued events for a session.
    pub async fn len(&self, key: &SessionKey) -> usize {
        let inner = self.inner.lock().await;
        inner.get(key).map(|slot| slot.queue.len()).unwrap_or(0)
    }
}
