//! Gateway request router.
//!
//! `frames` defines the wire protocol, `auth` the authentication ladder and
//! scope model, `methods` the registry and handlers, `nodes` the node
//! session registry and invoke relay, `approvals` the pending-approval
//! queue, and `server` the WebSocket connection lifecycle.

pub mod approvals;
pub mod auth;
pub mod frames;
pub mod methods;
pub mod nodes;
pub mod server;

pub use auth::{ConnectionContext, DeviceKeyRegistry, Role, ScopeSet, scope};
pub use frames::{
    ConnectParams, EventFrame, MAX_FRAME_BYTES, PROTOCOL_VERSION, RequestFrame, ResponseFrame,
    WireFrame,
};
pub use methods::{MethodContext, MethodError, MethodOutcome, MethodRegistry};
pub use nodes::{NodeRegistry, NodeSession};
pub use server::{Gateway, probe};
