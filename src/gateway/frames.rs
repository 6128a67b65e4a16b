//! Wire frames.
//!
//! The gateway speaks three JSON frame kinds over the WebSocket transport:
//! `req`, `res`, and `event`. A single request may produce several `res`
//! frames: every intermediate one carries a `status: "accepted"` marker and
//! the final frame's `ok` is authoritative.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// The protocol version this server speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted frame size.
pub const MAX_FRAME_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireFrame {
    #[serde(rename = "req")]
    Req(RequestFrame),
    #[serde(rename = "res")]
    Res(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// An intermediate streaming response; the payload is stamped with the
    /// `status: "accepted"` marker.
    pub fn accepted(id: impl Into<String>, payload: Value) -> Self {
        let mut payload = payload;
        if let Value::Object(ref mut map) = payload {
            map.insert("status".to_string(), Value::String("accepted".to_string()));
        } else {
            payload = serde_json::json!({ "status": "accepted", "value": payload });
        }
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.as_str().to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    pub payload: Value,
    pub seq: u64,
}

/// Client identity advertised at handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub mode: String,
}

/// Shared-secret auth block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Signed device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub client_id: String,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub signed_at_ms: i64,
    /// Must echo the challenge nonce sent at connection open.
    pub token: String,
    pub signature: String,
}

/// Node capabilities advertised by `role: "node"` clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: Value,
}

/// Handshake request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default)]
    pub auth: Option<AuthParams>,
    #[serde(default)]
    pub device: Option<DeviceIdentity>,
    /// Scopes the client asks for; the granted set never exceeds what the
    /// authentication mode allows.
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub node: Option<NodeInfo>,
}
