//! Node registry and the invoke relay.
//!
//! Nodes are remote clients (phones, desktops) that connect with
//! `role: "node"` and execute commands on behalf of operators. The registry
//! tracks live node sessions and the pending server-initiated invokes
//! awaiting their `node.invoke.result`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::gateway::methods::MethodError;
use crate::util::time::now_ms;

/// One registered node connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSession {
    pub node_id: String,
    #[serde(skip)]
    pub conn_id: Uuid,
    pub display_name: String,
    pub platform: String,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: Value,
    pub connected_at_ms: i64,
}

struct PendingInvoke {
    conn_id: Uuid,
    tx: oneshot::Sender<Result<Value, MethodError>>,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeSession>>,
    pending: Mutex<HashMap<String, PendingInvoke>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node at handshake. A reconnecting node replaces its
    /// previous session.
    pub fn register(
        &self,
        node_id: &str,
        conn_id: Uuid,
        display_name: &str,
        platform: &str,
        caps: Vec<String>,
        commands: Vec<String>,
        permissions: Value,
    ) {
        self.nodes.lock().unwrap().insert(
            node_id.to_string(),
            NodeSession {
                node_id: node_id.to_string(),
                conn_id,
                display_name: display_name.to_string(),
                platform: platform.to_string(),
                caps,
                commands,
                permissions,
                connected_at_ms: now_ms(),
            },
        );
    }

    pub fn lookup(&self, node_id: &str) -> Option<NodeSession> {
        self.nodes.lock().unwrap().get(node_id).cloned()
    }

    pub fn list(&self) -> Vec<NodeSession> {
        let mut nodes: Vec<NodeSession> = self.nodes.lock().unwrap().values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Remove whatever node session lives on a closing connection, and fail
    /// the invokes that were waiting on it.
    pub fn disconnect(&self, conn_id: Uuid) {
        self.nodes
            .lock()
            .unwrap()
            .retain(|_, session| session.conn_id != conn_id);

        let orphaned: Vec<PendingInvoke> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.conn_id == conn_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for invoke in orphaned {
            let _ = invoke.tx.send(Err(MethodError::new(
                crate::error::ErrorCode::NotFound,
                "node disconnected",
            )));
        }
    }

    /// Track a fresh server-initiated invoke against the node's connection.
    pub fn begin_invoke(
        &self,
        invoke_id: &str,
        node_conn: Uuid,
    ) -> oneshot::Receiver<Result<Value, MethodError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            invoke_id.to_string(),
            PendingInvoke {
                conn_id: node_conn,
                tx,
            },
        );
        rx
    }

    /// Deliver a node's result to the waiting operator. Returns `false` for
    /// unknown (or already timed-out) invoke ids.
    pub fn complete_invoke(&self, invoke_id: &str, result: Result<Value, MethodError>) -> bool {
        match self.pending.lock().unwrap().remove(invoke_id) {
            Some(invoke) => invoke.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop a pending invoke (timeout path).
    pub fn abandon_invoke(&self, invoke_id: &str) {
        self.pending.lock().unwrap().remove(invoke_id);
    }
}
