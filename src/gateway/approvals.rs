//! In-memory approval queue.
//!
//! Risky actions (exec requests, pairing confirmations) park here until an
//! operator with the approvals scope resolves them. The requesting side
//! awaits the verdict through a oneshot.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::util::time::now_ms;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    pub summary: String,
    pub details: Value,
    pub requested_at_ms: i64,
}

struct Slot {
    info: PendingApproval,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
pub struct ApprovalQueue {
    pending: Mutex<HashMap<String, Slot>>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a request; the returned receiver resolves with the verdict.
    pub fn request(&self, summary: &str, details: Value) -> (String, oneshot::Receiver<bool>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id.clone(),
            Slot {
                info: PendingApproval {
                    id: id.clone(),
                    summary: summary.to_string(),
                    details,
                    requested_at_ms: now_ms(),
                },
                tx,
            },
        );
        (id, rx)
    }

    pub fn list(&self) -> Vec<PendingApproval> {
        let mut items: Vec<PendingApproval> = self
            .pending
            .lock()
            .unwrap()
            .values()
            .map(|slot| slot.info.clone())
            .collect();
        items.sort_by_key(|item| item.requested_at_ms);
        items
    }

    /// Resolve a pending approval. Returns `false` for unknown ids.
    pub fn resolve(&self, id: &str, approve: bool) -> bool {
        match self.pending.lock().unwrap().remove(id) {
            Some(slot) => {
                let _ = slot.tx.send(approve);
                true
            }
            None => false,
        }
    }
}
