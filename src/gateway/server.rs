//! WebSocket gateway server.
//!
//! Each connection gets a challenge event, one handshake request, then a
//! bidirectional request/event stream. Events carry a per-connection
//! strictly increasing `seq`; a `tick` keep-alive goes out on an interval.
//! Method handlers run in their own tasks so a slow handler never blocks
//! the read loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue},
    middleware::{self, Next},
    response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BindScope;
use crate::error::ErrorCode;
use crate::gateway::auth::{
    ConnectionContext, PeerFacts, Role, authenticate, challenge_nonce, origin_allowed,
};
use crate::gateway::frames::{
    ConnectParams, EventFrame, MAX_FRAME_BYTES, PROTOCOL_VERSION, RequestFrame, ResponseFrame,
    WireFrame,
};
use crate::gateway::methods::{
    GatewayLink, MethodContext, MethodOutcome, MethodRegistry,
};
use crate::runtime::CoreRuntime;

enum Outgoing {
    Res(ResponseFrame),
    Event { event: String, payload: Value },
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
    ctx: ConnectionContext,
}

pub struct Gateway {
    runtime: Arc<CoreRuntime>,
    registry: MethodRegistry,
    conns: StdRwLock<HashMap<Uuid, ConnHandle>>,
    config_overrides: Arc<StdMutex<serde_json::Map<String, Value>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(runtime: Arc<CoreRuntime>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let gateway = Arc::new(Self {
            runtime,
            registry: MethodRegistry::standard(),
            conns: StdRwLock::new(HashMap::new()),
            config_overrides: Arc::new(StdMutex::new(serde_json::Map::new())),
            shutdown_tx,
        });
        gateway.start_forwarders();
        gateway
    }

    /// Bind listeners per the configured scope. Loopback binds v4 and,
    /// best effort, v6.
    pub async fn bind(self: &Arc<Self>) -> std::io::Result<Vec<TcpListener>> {
        let port = self.runtime.config.gateway.port;
        let mut listeners = Vec::new();
        match self.runtime.config.gateway.bind {
            BindScope::Loopback => {
                listeners.push(TcpListener::bind(("127.0.0.1", port)).await?);
                if let Ok(v6) = TcpListener::bind(("::1", port)).await {
                    listeners.push(v6);
                }
            }
            BindScope::All => {
                listeners.push(TcpListener::bind(("0.0.0.0", port)).await?);
            }
        }
        Ok(listeners)
    }

    /// Serve connections on one listener until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let app = self.clone().router();
        info!(addr = %listener.local_addr()?, "Gateway listening");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    }

    /// Stop accepting connections and signal every open socket to close.
    /// Waits up to the configured grace for connections to drain.
    pub async fn shutdown(self: &Arc<Self>) {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + self.runtime.config.gateway.shutdown_grace;
        while tokio::time::Instant::now() < deadline {
            if self.conns.read().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        warn!("Gateway shutdown grace expired with connections still open");
    }

    pub fn connection_count(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .layer(middleware::from_fn(security_headers))
            .with_state(self)
    }

    /// Forward subsystem broadcasts to connected operators.
    fn start_forwarders(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let mut cron_events = self.runtime.cron.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = cron_events.recv().await {
                gateway.broadcast_event(
                    &format!("cron.{}", event.action.as_str()),
                    json!({
                        "jobId": event.job_id,
                        "status": event.status.map(|s| s.to_string()),
                        "error": event.error,
                    }),
                );
            }
        });

        let gateway = Arc::clone(self);
        let mut deliveries = self.runtime.cron.subscribe_deliveries();
        tokio::spawn(async move {
            while let Ok(delivery) = deliveries.recv().await {
                gateway.broadcast_event(
                    "cron.delivery",
                    json!({
                        "jobId": delivery.job_id,
                        "channel": delivery.channel,
                        "to": delivery.to,
                        "text": delivery.text,
                    }),
                );
            }
        });

        let gateway = Arc::clone(self);
        let mut heartbeats = self.runtime.runner.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = heartbeats.recv().await {
                gateway.broadcast_event(
                    "heartbeat.result",
                    json!({
                        "agentId": event.agent_id,
                        "reason": event.reason,
                        "status": event.status,
                        "indicator": event.indicator,
                        "target": event.target,
                        "content": event.content,
                    }),
                );
            }
        });

        let gateway = Arc::clone(self);
        let mut notices = self.runtime.sessions.subscribe();
        tokio::spawn(async move {
            while let Ok(notice) = notices.recv().await {
                let crate::session::StoreNotice::Reset { path } = notice;
                gateway.broadcast_event("store.reset", json!({ "path": path }));
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, facts: PeerFacts) {
        let conn_id = Uuid::new_v4();
        let challenge = challenge_nonce();
        let mut seq: u64 = 0;

        // Plaintext challenge event before anything else.
        seq += 1;
        let challenge_frame = WireFrame::Event(EventFrame {
            event: "challenge".to_string(),
            payload: json!({ "nonce": challenge }),
            seq,
        });
        if send_frame(&mut socket, &challenge_frame).await.is_err() {
            return;
        }

        let Some(ctx) = self
            .handshake(&mut socket, conn_id, &facts, &challenge)
            .await
        else {
            return;
        };
        info!(
            conn = %conn_id,
            role = ctx.role.as_str(),
            mode = ctx.auth_mode,
            client = %ctx.client.id,
            "Gateway connection established"
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        self.conns.write().unwrap().insert(
            conn_id,
            ConnHandle {
                tx: tx.clone(),
                ctx: ctx.clone(),
            },
        );

        let mut tick = tokio::time::interval(self.runtime.config.gateway.tick_interval);
        tick.tick().await; // skip the immediate first tick
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(outgoing) = outgoing else { break };
                    let frame = match outgoing {
                        Outgoing::Res(res) => WireFrame::Res(res),
                        Outgoing::Event { event, payload } => {
                            seq += 1;
                            WireFrame::Event(EventFrame { event, payload, seq })
                        }
                    };
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(conn_id, text.as_str(), &tx);
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            match std::str::from_utf8(&bytes) {
                                Ok(text) => self.handle_text(conn_id, text, &tx),
                                Err(_) => debug!(conn = %conn_id, "Dropping non-UTF8 binary frame"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if socket.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(conn = %conn_id, error = %e, "WebSocket error");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    let _ = tx.send(Outgoing::Event {
                        event: "tick".to_string(),
                        payload: json!({}),
                    });
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        self.conns.write().unwrap().remove(&conn_id);
        self.runtime.nodes.disconnect(conn_id);
        info!(conn = %conn_id, "Gateway connection closed");
    }

    /// Validate the first frame: protocol intersection, origin, auth.
    /// Returns `None` after responding and closing on any failure.
    async fn handshake(
        &self,
        socket: &mut WebSocket,
        conn_id: Uuid,
        facts: &PeerFacts,
        challenge: &str,
    ) -> Option<ConnectionContext> {
        let timeout = self.runtime.config.gateway.handshake_timeout;
        let first = match tokio::time::timeout(timeout, socket.recv()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(_) => {
                debug!(conn = %conn_id, "Connection closed before handshake");
                return None;
            }
            Err(_) => {
                debug!(conn = %conn_id, "Handshake timed out");
                return None;
            }
        };

        let req = match serde_json::from_str::<WireFrame>(first.as_str()) {
            Ok(WireFrame::Req(req)) if req.method == "connect" => req,
            _ => {
                let res = ResponseFrame::err(
                    "connect",
                    ErrorCode::InvalidRequest,
                    "first frame must be a connect request",
                );
                let _ = send_frame(socket, &WireFrame::Res(res)).await;
                return None;
            }
        };

        let fail = |id: &str, code: ErrorCode, message: &str| {
            WireFrame::Res(ResponseFrame::err(id, code, message))
        };

        let params = match serde_json::from_value::<ConnectParams>(req.params.clone()) {
            Ok(params) => params,
            Err(e) => {
                let frame = fail(&req.id, ErrorCode::InvalidRequest, &format!("bad connect params: {e}"));
                let _ = send_frame(socket, &frame).await;
                return None;
            }
        };

        // Highest commonly supported version; we only speak 1.
        if params.max_protocol < PROTOCOL_VERSION || params.min_protocol > PROTOCOL_VERSION {
            let frame = fail(
                &req.id,
                ErrorCode::ProtocolVersion,
                &format!("server speaks protocol {PROTOCOL_VERSION}"),
            );
            let _ = send_frame(socket, &frame).await;
            return None;
        }

        let gateway_config = &self.runtime.config.gateway;
        if !origin_allowed(gateway_config, &params.client, facts.origin.as_deref()) {
            let frame = fail(&req.id, ErrorCode::Unauthorized, "origin not allowed");
            let _ = send_frame(socket, &frame).await;
            return None;
        }

        let ctx = match authenticate(
            gateway_config,
            &self.runtime.devices,
            facts,
            &params,
            challenge,
            conn_id,
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                let frame = fail(&req.id, e.code, &e.message);
                let _ = send_frame(socket, &frame).await;
                return None;
            }
        };

        if ctx.role == Role::Node {
            let node = params.node.clone().unwrap_or_default();
            let node_id = node
                .node_id
                .unwrap_or_else(|| params.client.id.clone());
            self.runtime.nodes.register(
                &node_id,
                conn_id,
                &params.client.display_name,
                &params.client.platform,
                node.caps,
                node.commands,
                node.permissions,
            );
        }

        let hello = ResponseFrame::ok(
            req.id.as_str(),
            json!({
                "event": "hello-ok",
                "protocolVersion": PROTOCOL_VERSION,
                "serverVersion": env!("CARGO_PKG_VERSION"),
                "capabilities": ["cron", "heartbeat", "nodes", "approvals", "pairing"],
            }),
        );
        if send_frame(socket, &WireFrame::Res(hello)).await.is_err() {
            return None;
        }
        Some(ctx)
    }

    /// Parse one inbound frame and, for requests, dispatch the method in
    /// its own task.
    fn handle_text(
        self: &Arc<Self>,
        conn_id: Uuid,
        text: &str,
        tx: &mpsc::UnboundedSender<Outgoing>,
    ) {
        if text.len() > MAX_FRAME_BYTES {
            // Best effort: surface the rejection when the id is parseable.
            if let Ok(WireFrame::Req(req)) = serde_json::from_str::<WireFrame>(text) {
                let _ = tx.send(Outgoing::Res(ResponseFrame::err(
                    req.id,
                    ErrorCode::PayloadTooLarge,
                    format!("frames are limited to {MAX_FRAME_BYTES} bytes"),
                )));
            }
            return;
        }

        match serde_json::from_str::<WireFrame>(text) {
            Ok(WireFrame::Req(req)) => self.dispatch_request(conn_id, req, tx.clone()),
            Ok(WireFrame::Res(res)) => {
                debug!(conn = %conn_id, id = %res.id, "Ignoring unsolicited response frame");
            }
            Ok(WireFrame::Event(event)) => {
                debug!(conn = %conn_id, event = %event.event, "Ignoring client event frame");
            }
            Err(e) => {
                debug!(conn = %conn_id, error = %e, "Unparseable frame");
            }
        }
    }

    fn dispatch_request(
        self: &Arc<Self>,
        conn_id: Uuid,
        req: RequestFrame,
        tx: mpsc::UnboundedSender<Outgoing>,
    ) {
        if req.id.is_empty() {
            debug!(conn = %conn_id, method = %req.method, "Dropping request with empty id");
            return;
        }
        let Some(ctx) = self.method_context(conn_id) else {
            return;
        };

        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let RequestFrame { id, method, params } = req;
            let result = gateway
                .registry
                .dispatch(&gateway.runtime.config.gateway, ctx, &method, params)
                .await;
            match result {
                Ok(MethodOutcome::Final(payload)) => {
                    let _ = tx.send(Outgoing::Res(ResponseFrame::ok(id.as_str(), payload)));
                }
                Ok(MethodOutcome::Accepted { ack, follow }) => {
                    let _ = tx.send(Outgoing::Res(ResponseFrame::accepted(id.as_str(), ack)));
                    match follow.await {
                        Ok(payload) => {
                            let _ = tx.send(Outgoing::Res(ResponseFrame::ok(id.as_str(), payload)));
                        }
                        Err(e) => {
                            let _ = tx.send(Outgoing::Res(ResponseFrame::err(id.as_str(), e.code, e.message)));
                        }
                    }
                }
                Err(e) => {
                    debug!(method = %method, code = %e.code, "Method failed");
                    let _ = tx.send(Outgoing::Res(ResponseFrame::err(id.as_str(), e.code, e.message)));
                }
            }
        });
    }

    fn method_context(&self, conn_id: Uuid) -> Option<MethodContext> {
        let conns = self.conns.read().unwrap();
        let handle = conns.get(&conn_id)?;
        Some(MethodContext {
            config: self.runtime.config.clone(),
            sessions: self.runtime.sessions.clone(),
            lanes: self.runtime.lanes.clone(),
            events: self.runtime.events.clone(),
            cron: self.runtime.cron.clone(),
            wake: self.runtime.wake.clone(),
            heartbeats: self.runtime.heartbeats.clone(),
            nodes: self.runtime.nodes.clone(),
            approvals: self.runtime.approvals.clone(),
            devices: self.runtime.devices.clone(),
            executor: self.runtime.executor.clone(),
            link: self.link(),
            config_overrides: self.config_overrides.clone(),
            conn: handle.ctx.clone(),
        })
    }

    fn link(&self) -> Arc<dyn GatewayLink> {
        // The registry holds the Gateway through the runtime Arc graph;
        // connections only live as long as the gateway itself.
        Arc::new(LinkHandle {
            conns: self.snapshot_senders(),
        })
    }

    fn snapshot_senders(&self) -> Vec<(Uuid, Role, bool, mpsc::UnboundedSender<Outgoing>)> {
        self.conns
            .read()
            .unwrap()
            .iter()
            .map(|(id, handle)| {
                (
                    *id,
                    handle.ctx.role,
                    handle.ctx.authenticated || handle.ctx.auth_mode == "local",
                    handle.tx.clone(),
                )
            })
            .collect()
    }

    fn broadcast_event(&self, event: &str, payload: Value) {
        for (_, role, admitted, tx) in self.snapshot_senders() {
            if role == Role::Operator && admitted {
                let _ = tx.send(Outgoing::Event {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

/// A point-in-time view of the connection table, handed to method handlers.
struct LinkHandle {
    conns: Vec<(Uuid, Role, bool, mpsc::UnboundedSender<Outgoing>)>,
}

impl GatewayLink for LinkHandle {
    fn send_event_to(&self, conn_id: Uuid, event: &str, payload: Value) -> bool {
        for (id, _, _, tx) in &self.conns {
            if *id == conn_id {
                return tx
                    .send(Outgoing::Event {
                        event: event.to_string(),
                        payload,
                    })
                    .is_ok();
            }
        }
        false
    }

    fn broadcast_event(&self, event: &str, payload: Value) {
        for (_, role, admitted, tx) in &self.conns {
            if *role == Role::Operator && *admitted {
                let _ = tx.send(Outgoing::Event {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &WireFrame) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let facts = PeerFacts {
        peer_ip: Some(addr.ip()),
        host: header("host"),
        origin: header("origin"),
        forwarded_for: header("x-forwarded-for"),
        tailscale_user: header("tailscale-user-login"),
    };

    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| gateway.handle_socket(socket, facts))
}

/// Security headers for anything served from the gateway port.
async fn security_headers(request: axum::extract::Request, next: Next) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

/// "Is the gateway running on this port": the only interface the service
/// lifecycle CLI needs.
pub async fn probe(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_reports_listening_state() {
        // Nothing bound yet.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe(port).await);
        drop(listener);
        assert!(!probe(port).await);
    }
}
