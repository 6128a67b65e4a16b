//! Method registry and dispatch.
//!
//! Every gateway method resolves through a registry entry carrying its
//! required scope; handlers run against a context that exposes the stores,
//! queues, schedulers, and the connection link. Unknown methods are
//! rejected with `unknown-method`, and `config.*` / `wizard.*` always
//! require admin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::{CoreConfig, GatewayConfig};
use crate::cron::{CronScheduler, JobPatch};
use crate::error::{CronError, ErrorCode, StoreError};
use crate::events::SystemEventQueue;
use crate::executor::AgentExecutor;
use crate::gateway::approvals::ApprovalQueue;
use crate::gateway::auth::{ConnectionContext, DeviceKeyRegistry, Role, scope};
use crate::gateway::frames::PROTOCOL_VERSION;
use crate::gateway::nodes::NodeRegistry;
use crate::heartbeat::{Heartbeats, WakeCoordinator};
use crate::lanes::CommandLanes;
use crate::session::{SessionKey, SessionStore};

/// Default and maximum wait for a node to answer an invoke.
const NODE_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// A handler error: wire code plus a display-safe message.
#[derive(Debug, Clone)]
pub struct MethodError {
    pub code: ErrorCode,
    pub message: String,
}

impl MethodError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<StoreError> for MethodError {
    fn from(err: StoreError) -> Self {
        Self::new(err.wire_code(), err.to_string())
    }
}

impl From<crate::error::ExecutorError> for MethodError {
    fn from(err: crate::error::ExecutorError) -> Self {
        Self::new(err.wire_code(), err.to_string())
    }
}

impl From<CronError> for MethodError {
    fn from(err: CronError) -> Self {
        let code = match &err {
            CronError::UnknownJob { .. } => ErrorCode::NotFound,
            CronError::InvalidSchedule { .. } => ErrorCode::InvalidRequest,
            CronError::Store(inner) => inner.wire_code(),
        };
        Self::new(code, err.to_string())
    }
}

/// Scope classes a method can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodScope {
    Read,
    Write,
    Approvals,
    Pairing,
    Admin,
}

impl MethodScope {
    pub fn required(&self) -> &'static str {
        match self {
            MethodScope::Read => scope::READ,
            MethodScope::Write => scope::WRITE,
            MethodScope::Approvals => scope::APPROVALS,
            MethodScope::Pairing => scope::PAIRING,
            MethodScope::Admin => scope::ADMIN,
        }
    }
}

/// What a handler returns.
pub enum MethodOutcome {
    /// One final response.
    Final(Value),
    /// An intermediate `status: "accepted"` response followed by the final
    /// one once `follow` resolves.
    Accepted {
        ack: Value,
        follow: BoxFuture<'static, Result<Value, MethodError>>,
    },
}

impl std::fmt::Debug for MethodOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodOutcome::Final(value) => f.debug_tuple("Final").field(value).finish(),
            MethodOutcome::Accepted { ack, .. } => {
                f.debug_struct("Accepted").field("ack", ack).finish()
            }
        }
    }
}

/// The router's side of the connection table, as handlers see it.
pub trait GatewayLink: Send + Sync {
    /// Send an event to one connection. Returns `false` when it is gone.
    fn send_event_to(&self, conn_id: Uuid, event: &str, payload: Value) -> bool;
    /// Send an event to every authenticated operator connection.
    fn broadcast_event(&self, event: &str, payload: Value);
}

/// Capabilities a handler runs against.
#[derive(Clone)]
pub struct MethodContext {
    pub config: CoreConfig,
    pub sessions: Arc<SessionStore>,
    pub lanes: Arc<CommandLanes>,
    pub events: Arc<SystemEventQueue>,
    pub cron: Arc<CronScheduler>,
    pub wake: Arc<WakeCoordinator>,
    pub heartbeats: Arc<Heartbeats>,
    pub nodes: Arc<NodeRegistry>,
    pub approvals: Arc<ApprovalQueue>,
    pub devices: Arc<DeviceKeyRegistry>,
    pub executor: Arc<dyn AgentExecutor>,
    pub link: Arc<dyn GatewayLink>,
    pub config_overrides: Arc<StdMutex<serde_json::Map<String, Value>>>,
    /// The requesting connection.
    pub conn: ConnectionContext,
}

type Handler = Arc<
    dyn Fn(MethodContext, Value) -> BoxFuture<'static, Result<MethodOutcome, MethodError>>
        + Send
        + Sync,
>;

pub struct MethodSpec {
    pub scope: MethodScope,
    handler: Handler,
}

pub struct MethodRegistry {
    methods: HashMap<&'static str, MethodSpec>,
}

impl MethodRegistry {
    /// The standard method table.
    pub fn standard() -> Self {
        let mut methods = HashMap::new();
        let mut add = |name: &'static str, scope: MethodScope, handler: Handler| {
            methods.insert(name, MethodSpec { scope, handler });
        };

        add("status", MethodScope::Read, wrap(status));
        add("sessions.list", MethodScope::Read, wrap(sessions_list));
        add("sessions.get", MethodScope::Read, wrap(sessions_get));
        add("sessions.patch", MethodScope::Write, wrap(sessions_patch));
        add("sessions.delete", MethodScope::Write, wrap(sessions_delete));
        add("agents.create", MethodScope::Write, wrap(agents_create));
        add("chat.send", MethodScope::Write, wrap(chat_send));
        add("events.enqueue", MethodScope::Write, wrap(events_enqueue));
        add("events.peek", MethodScope::Read, wrap(events_peek));
        add("heartbeat.wake", MethodScope::Write, wrap(heartbeat_wake));
        add("cron.list", MethodScope::Read, wrap(cron_list));
        add("cron.add", MethodScope::Write, wrap(cron_add));
        add("cron.update", MethodScope::Write, wrap(cron_update));
        add("cron.remove", MethodScope::Write, wrap(cron_remove));
        add("cron.run", MethodScope::Write, wrap(cron_run));
        add("node.list", MethodScope::Read, wrap(node_list));
        add("node.invoke", MethodScope::Write, wrap(node_invoke));
        add(
            "node.invoke.result",
            MethodScope::Write,
            wrap(node_invoke_result),
        );
        add(
            "approvals.request",
            MethodScope::Approvals,
            wrap(approvals_request),
        );
        add("approvals.list", MethodScope::Approvals, wrap(approvals_list));
        add(
            "approvals.resolve",
            MethodScope::Approvals,
            wrap(approvals_resolve),
        );
        add("pairing.start", MethodScope::Pairing, wrap(pairing_start));
        add("pairing.confirm", MethodScope::Pairing, wrap(pairing_confirm));
        add("config.get", MethodScope::Admin, wrap(config_get));
        add("config.set", MethodScope::Admin, wrap(config_set));

        Self { methods }
    }

    pub fn spec(&self, method: &str) -> Option<&MethodSpec> {
        self.methods.get(method)
    }

    /// Role and scope checks for one invocation.
    pub fn authorize(
        &self,
        gateway: &GatewayConfig,
        conn: &ConnectionContext,
        method: &str,
    ) -> Result<(), MethodError> {
        if conn.role == Role::Node {
            if gateway.node_methods.iter().any(|m| m == method) {
                return Ok(());
            }
            return Err(MethodError::new(
                ErrorCode::UnauthorizedRole,
                format!("role node may not invoke {method}"),
            ));
        }

        if (method.starts_with("config.") || method.starts_with("wizard."))
            && !conn.scopes.grants(scope::ADMIN)
        {
            return Err(MethodError::new(
                ErrorCode::MissingScope,
                format!("{method} requires {}", scope::ADMIN),
            ));
        }

        let spec = self
            .spec(method)
            .ok_or_else(|| MethodError::new(ErrorCode::UnknownMethod, format!("unknown method {method}")))?;

        let required = spec.scope.required();
        if !conn.scopes.grants(required) {
            return Err(MethodError::new(
                ErrorCode::MissingScope,
                format!("{method} requires {required}"),
            ));
        }
        Ok(())
    }

    /// Authorize and run a method.
    pub async fn dispatch(
        &self,
        gateway: &GatewayConfig,
        ctx: MethodContext,
        method: &str,
        params: Value,
    ) -> Result<MethodOutcome, MethodError> {
        self.authorize(gateway, &ctx.conn, method)?;
        let spec = self
            .spec(method)
            .ok_or_else(|| MethodError::new(ErrorCode::UnknownMethod, format!("unknown method {method}")))?;
        (spec.handler)(ctx, params).await
    }
}

fn wrap<F, Fut>(f: F) -> Handler
where
    F: Fn(MethodContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<MethodOutcome, MethodError>> + Send + 'static,
{
    Arc::new(move |ctx, params| Box::pin(f(ctx, params)))
}

// ── Param helpers ───────────────────────────────────────────────────────

fn str_param(params: &Value, key: &str) -> Result<String, MethodError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| MethodError::invalid(format!("missing required param {key}")))
}

fn session_key_param(ctx: &MethodContext, params: &Value) -> SessionKey {
    params
        .get("sessionKey")
        .and_then(|v| v.as_str())
        .map(SessionKey::new)
        .unwrap_or_else(|| SessionKey::main(&ctx.config.agent_id))
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn status(ctx: MethodContext, _params: Value) -> Result<MethodOutcome, MethodError> {
    Ok(MethodOutcome::Final(json!({
        "ok": true,
        "serverVersion": env!("CARGO_PKG_VERSION"),
        "protocolVersion": PROTOCOL_VERSION,
        "agentId": ctx.config.agent_id,
        "lanes": { "queued": ctx.lanes.queue_size(None) },
        "cronJobs": ctx.cron.list_jobs().await.len(),
        "heartbeatAgents": ctx.heartbeats.agent_ids(),
        "nodes": ctx.nodes.list().len(),
    })))
}

async fn sessions_list(ctx: MethodContext, _params: Value) -> Result<MethodOutcome, MethodError> {
    let map = ctx.sessions.load().await?;
    let sessions: Vec<Value> = map
        .iter()
        .map(|(key, entry)| json!({ "key": key, "entry": entry }))
        .collect();
    Ok(MethodOutcome::Final(json!({ "sessions": sessions })))
}

async fn sessions_get(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let key = SessionKey::new(str_param(&params, "key")?);
    let map = ctx.sessions.load().await?;
    match map.get(&key) {
        Some(entry) => Ok(MethodOutcome::Final(json!({ "key": key, "entry": entry }))),
        None => Err(MethodError::not_found(format!("no session {key}"))),
    }
}

async fn sessions_patch(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let key = SessionKey::new(str_param(&params, "key")?);
    let patch = params.clone();
    let entry = ctx
        .sessions
        .update(move |map| {
            let entry = map.get_mut(&key)?;
            if let Some(subject) = patch.get("subject").and_then(|v| v.as_str()) {
                entry.subject = Some(subject.to_string());
            }
            if let Some(label) = patch.get("label").and_then(|v| v.as_str()) {
                entry.label = Some(label.to_string());
            }
            if let Some(level) = patch.get("thinkLevel").and_then(|v| v.as_str()) {
                entry.think_level = Some(level.to_string());
            }
            if let Some(model) = patch.get("modelOverride").and_then(|v| v.as_str()) {
                entry.model_override = Some(model.to_string());
            }
            if let Some(provider) = patch.get("providerOverride").and_then(|v| v.as_str()) {
                entry.provider_override = Some(provider.to_string());
            }
            entry.touch();
            Some(entry.clone())
        })
        .await?;
    match entry {
        Some(entry) => Ok(MethodOutcome::Final(json!({ "entry": entry }))),
        None => Err(MethodError::not_found("no such session")),
    }
}

async fn sessions_delete(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let key = SessionKey::new(str_param(&params, "key")?);
    let removed = ctx
        .sessions
        .update(move |map| map.remove(&key).is_some())
        .await?;
    if removed {
        Ok(MethodOutcome::Final(json!({ "deleted": true })))
    } else {
        Err(MethodError::not_found("no such session"))
    }
}

async fn agents_create(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let agent_id = str_param(&params, "agentId")?;
    let key = SessionKey::main(&agent_id);
    let created = ctx
        .sessions
        .update({
            let key = key.clone();
            move |map| {
                if map.contains_key(&key) {
                    None
                } else {
                    let entry = crate::session::SessionEntry::new();
                    let session_id = entry.session_id;
                    map.insert(key, entry);
                    Some(session_id)
                }
            }
        })
        .await?;
    match created {
        Some(session_id) => Ok(MethodOutcome::Final(
            json!({ "key": key, "sessionId": session_id }),
        )),
        None => Err(MethodError::new(
            ErrorCode::Conflict,
            format!("agent {agent_id} already exists"),
        )),
    }
}

/// Run one operator-driven agent turn on the session's lane. Serialized
/// per session; the heartbeat runner backs off while this is queued.
async fn chat_send(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let message = str_param(&params, "message")?;
    let key = session_key_param(&ctx, &params);

    let session_id = ctx
        .sessions
        .update({
            let key = key.clone();
            move |map| {
                let entry = map.entry(key).or_default();
                entry.touch();
                entry.session_id
            }
        })
        .await?;

    let mut request = crate::executor::RunRequest::new(session_id, key.clone(), message);
    request.model = params
        .get("model")
        .and_then(|v| v.as_str())
        .map(String::from);
    request.think_level = params
        .get("thinking")
        .and_then(|v| v.as_str())
        .map(String::from);

    let lane = if key.is_main() {
        crate::lanes::lane::MAIN.to_string()
    } else {
        crate::lanes::session_lane(&key)
    };
    let executor = ctx.executor.clone();
    let ticket = ctx
        .lanes
        .enqueue(&lane, async move { executor.run(request).await });
    let outcome = match ticket.join().await {
        Ok(result) => result?,
        Err(e) => return Err(MethodError::new(ErrorCode::Internal, e.to_string())),
    };

    ctx.sessions
        .update({
            let key = key.clone();
            let usage = outcome.usage;
            move |map| {
                let entry = map.entry(key).or_default();
                entry.usage.absorb(usage.input, usage.output);
                entry.touch();
            }
        })
        .await?;

    Ok(MethodOutcome::Final(json!({
        "text": outcome.text,
        "blocks": outcome.blocks,
        "usage": outcome.usage,
    })))
}

async fn events_enqueue(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let text = str_param(&params, "text")?;
    let key = session_key_param(&ctx, &params);
    let queued = ctx.events.enqueue(&key, &text).await;
    Ok(MethodOutcome::Final(json!({ "queued": queued })))
}

async fn events_peek(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let key = session_key_param(&ctx, &params);
    let events = ctx.events.peek(&key).await;
    Ok(MethodOutcome::Final(json!({ "events": events })))
}

async fn heartbeat_wake(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let reason = params
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("gateway")
        .to_string();
    ctx.wake.request(&reason);
    Ok(MethodOutcome::Final(json!({ "requested": true })))
}

async fn cron_list(ctx: MethodContext, _params: Value) -> Result<MethodOutcome, MethodError> {
    Ok(MethodOutcome::Final(
        json!({ "jobs": ctx.cron.list_jobs().await }),
    ))
}

async fn cron_add(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let raw = params.get("job").cloned().unwrap_or(params);
    let job: crate::cron::CronJob = serde_json::from_value(raw)
        .map_err(|e| MethodError::invalid(format!("bad job definition: {e}")))?;
    let job = ctx.cron.add_job(job).await?;
    Ok(MethodOutcome::Final(json!({ "job": job })))
}

fn job_patch_from(params: &Value) -> Result<JobPatch, MethodError> {
    let mut patch = JobPatch {
        name: params
            .get("name")
            .and_then(|v| v.as_str())
            .map(String::from),
        enabled: params.get("enabled").and_then(|v| v.as_bool()),
        delete_after_run: params.get("deleteAfterRun").and_then(|v| v.as_bool()),
        ..JobPatch::default()
    };
    if let Some(description) = params.get("description") {
        patch.description = Some(description.as_str().map(String::from));
    }
    if let Some(value) = params.get("schedule") {
        patch.schedule = Some(
            serde_json::from_value(value.clone())
                .map_err(|e| MethodError::invalid(format!("bad schedule: {e}")))?,
        );
    }
    if let Some(value) = params.get("sessionTarget") {
        patch.session_target = Some(
            serde_json::from_value(value.clone())
                .map_err(|e| MethodError::invalid(format!("bad sessionTarget: {e}")))?,
        );
    }
    if let Some(value) = params.get("wakeMode") {
        patch.wake_mode = Some(
            serde_json::from_value(value.clone())
                .map_err(|e| MethodError::invalid(format!("bad wakeMode: {e}")))?,
        );
    }
    if let Some(value) = params.get("payload") {
        patch.payload = Some(
            serde_json::from_value(value.clone())
                .map_err(|e| MethodError::invalid(format!("bad payload: {e}")))?,
        );
    }
    if let Some(value) = params.get("delivery") {
        patch.delivery = Some(
            serde_json::from_value(value.clone())
                .map_err(|e| MethodError::invalid(format!("bad delivery: {e}")))?,
        );
    }
    Ok(patch)
}

async fn cron_update(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let id = str_param(&params, "id")?;
    let patch = job_patch_from(&params)?;
    let job = ctx.cron.update_job(&id, patch).await?;
    Ok(MethodOutcome::Final(json!({ "job": job })))
}

async fn cron_remove(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let id = str_param(&params, "id")?;
    ctx.cron.remove_job(&id).await?;
    Ok(MethodOutcome::Final(json!({ "removed": true })))
}

/// Streaming: acknowledge the dispatch, then report the final run status.
async fn cron_run(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let id = str_param(&params, "id")?;
    if ctx.cron.get_job(&id).await.is_none() {
        return Err(MethodError::not_found(format!("no cron job {id}")));
    }
    let cron = ctx.cron.clone();
    let follow_id = id.clone();
    Ok(MethodOutcome::Accepted {
        ack: json!({ "jobId": id }),
        follow: Box::pin(async move {
            let status = cron.run_now(&follow_id).await?;
            Ok(json!({ "jobId": follow_id, "status": status.to_string() }))
        }),
    })
}

async fn node_list(ctx: MethodContext, _params: Value) -> Result<MethodOutcome, MethodError> {
    Ok(MethodOutcome::Final(json!({ "nodes": ctx.nodes.list() })))
}

async fn node_invoke(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let node_id = str_param(&params, "nodeId")?;
    let command = str_param(&params, "command")?;
    let invoke_params = params.get("params").cloned().unwrap_or(Value::Null);
    let timeout = params
        .get("timeoutMs")
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
        .unwrap_or(NODE_INVOKE_TIMEOUT)
        .min(NODE_INVOKE_TIMEOUT);

    let node = ctx
        .nodes
        .lookup(&node_id)
        .ok_or_else(|| MethodError::not_found(format!("no node {node_id}")))?;

    let invoke_id = Uuid::new_v4().to_string();
    let rx = ctx.nodes.begin_invoke(&invoke_id, node.conn_id);
    let delivered = ctx.link.send_event_to(
        node.conn_id,
        "node.invoke.request",
        json!({
            "invokeId": invoke_id,
            "nodeId": node_id,
            "command": command,
            "params": invoke_params,
            "timeoutMs": timeout.as_millis() as u64,
        }),
    );
    if !delivered {
        ctx.nodes.abandon_invoke(&invoke_id);
        return Err(MethodError::not_found(format!("node {node_id} is gone")));
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result.map(MethodOutcome::Final),
        Ok(Err(_)) => Err(MethodError::new(
            ErrorCode::Internal,
            "node invoke dropped",
        )),
        Err(_) => {
            ctx.nodes.abandon_invoke(&invoke_id);
            Err(MethodError::new(
                ErrorCode::Timeout,
                format!("node {node_id} did not answer within {timeout:?}"),
            ))
        }
    }
}

async fn node_invoke_result(
    ctx: MethodContext,
    params: Value,
) -> Result<MethodOutcome, MethodError> {
    let invoke_id = str_param(&params, "invokeId")?;
    let ok = params.get("ok").and_then(|v| v.as_bool()).unwrap_or(true);
    let result = if ok {
        Ok(params.get("payload").cloned().unwrap_or(Value::Null))
    } else {
        let message = params
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("node command failed");
        Err(MethodError::new(ErrorCode::Internal, message))
    };
    let received = ctx.nodes.complete_invoke(&invoke_id, result);
    Ok(MethodOutcome::Final(json!({ "received": received })))
}

/// Streaming: acknowledge with the approval id, resolve with the verdict.
async fn approvals_request(
    ctx: MethodContext,
    params: Value,
) -> Result<MethodOutcome, MethodError> {
    let summary = str_param(&params, "summary")?;
    let details = params.get("details").cloned().unwrap_or(Value::Null);
    let (id, rx) = ctx.approvals.request(&summary, details.clone());
    ctx.link
        .broadcast_event("approval.pending", json!({ "id": id, "summary": summary, "details": details }));
    Ok(MethodOutcome::Accepted {
        ack: json!({ "approvalId": id }),
        follow: Box::pin(async move {
            let approved = rx
                .await
                .map_err(|_| MethodError::new(ErrorCode::Internal, "approval dropped"))?;
            Ok(json!({ "approved": approved }))
        }),
    })
}

async fn approvals_list(ctx: MethodContext, _params: Value) -> Result<MethodOutcome, MethodError> {
    Ok(MethodOutcome::Final(
        json!({ "approvals": ctx.approvals.list() }),
    ))
}

async fn approvals_resolve(
    ctx: MethodContext,
    params: Value,
) -> Result<MethodOutcome, MethodError> {
    let id = str_param(&params, "id")?;
    let approve = params
        .get("approve")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| MethodError::invalid("missing required param approve"))?;
    if ctx.approvals.resolve(&id, approve) {
        Ok(MethodOutcome::Final(json!({ "resolved": true })))
    } else {
        Err(MethodError::not_found(format!("no pending approval {id}")))
    }
}

async fn pairing_start(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let device_id = str_param(&params, "deviceId")?;
    let code = ctx.devices.start_pairing(&device_id);
    Ok(MethodOutcome::Final(json!({ "code": code })))
}

async fn pairing_confirm(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let code = str_param(&params, "code")?;
    let key = str_param(&params, "key")?;
    match ctx.devices.confirm_pairing(&code, &key) {
        Some(device_id) => Ok(MethodOutcome::Final(json!({ "deviceId": device_id }))),
        None => Err(MethodError::not_found("unknown pairing code")),
    }
}

async fn config_get(ctx: MethodContext, _params: Value) -> Result<MethodOutcome, MethodError> {
    let overrides = ctx.config_overrides.lock().unwrap().clone();
    Ok(MethodOutcome::Final(json!({
        "stateDir": ctx.config.state_dir.display().to_string(),
        "agentId": ctx.config.agent_id,
        "gateway": {
            "port": ctx.config.gateway.port,
            "bind": match ctx.config.gateway.bind {
                crate::config::BindScope::Loopback => "loopback",
                crate::config::BindScope::All => "all",
            },
            "allowedOrigins": ctx.config.gateway.allowed_origins,
            "nodeMethods": ctx.config.gateway.node_methods,
        },
        "overrides": overrides,
    })))
}

async fn config_set(ctx: MethodContext, params: Value) -> Result<MethodOutcome, MethodError> {
    let key = str_param(&params, "key")?;
    let value = params
        .get("value")
        .cloned()
        .ok_or_else(|| MethodError::invalid("missing required param value"))?;
    ctx.config_overrides.lock().unwrap().insert(key, value);
    Ok(MethodOutcome::Final(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::UnconfiguredExecutor;
    use crate::gateway::auth::ScopeSet;
    use crate::runtime::CoreRuntime;

    struct NullLink;
    impl GatewayLink for NullLink {
        fn send_event_to(&self, _conn_id: Uuid, _event: &str, _payload: Value) -> bool {
            false
        }
        fn broadcast_event(&self, _event: &str, _payload: Value) {}
    }

    fn conn(role: Role, scopes: ScopeSet) -> ConnectionContext {
        ConnectionContext {
            conn_id: Uuid::new_v4(),
            role,
            scopes,
            client: Default::default(),
            device_id: None,
            authenticated: true,
            auth_mode: "token",
        }
    }

    fn context(runtime: &Arc<CoreRuntime>, conn: ConnectionContext) -> MethodContext {
        MethodContext {
            config: runtime.config.clone(),
            sessions: runtime.sessions.clone(),
            lanes: runtime.lanes.clone(),
            events: runtime.events.clone(),
            cron: runtime.cron.clone(),
            wake: runtime.wake.clone(),
            heartbeats: runtime.heartbeats.clone(),
            nodes: runtime.nodes.clone(),
            approvals: runtime.approvals.clone(),
            devices: runtime.devices.clone(),
            executor: runtime.executor.clone(),
            link: Arc::new(NullLink),
            config_overrides: Arc::new(StdMutex::new(Default::default())),
            conn,
        }
    }

    fn test_runtime() -> (Arc<CoreRuntime>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            state_dir: tmp.path().to_path_buf(),
            ..CoreConfig::default()
        };
        (
            CoreRuntime::build(config, Arc::new(UnconfiguredExecutor)),
            tmp,
        )
    }

    #[test]
    fn write_method_needs_write_scope() {
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let read_only = conn(Role::Operator, ScopeSet::from_names([scope::READ]));

        let err = registry
            .authorize(&gateway, &read_only, "agents.create")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingScope);
        assert!(err.message.contains(scope::WRITE));

        assert!(registry.authorize(&gateway, &read_only, "status").is_ok());
    }

    #[test]
    fn admin_scope_grants_everything() {
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let admin = conn(Role::Operator, ScopeSet::admin());

        for method in [
            "status",
            "agents.create",
            "cron.add",
            "approvals.resolve",
            "pairing.start",
            "config.get",
        ] {
            assert!(registry.authorize(&gateway, &admin, method).is_ok(), "{method}");
        }
    }

    #[test]
    fn config_prefix_requires_admin_even_with_write() {
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let writer = conn(
            Role::Operator,
            ScopeSet::from_names([scope::READ, scope::WRITE]),
        );

        let err = registry
            .authorize(&gateway, &writer, "config.set")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingScope);
        assert!(err.message.contains(scope::ADMIN));

        // Unregistered wizard methods hit the admin wall first.
        let err = registry
            .authorize(&gateway, &writer, "wizard.start")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingScope);
    }

    #[test]
    fn node_role_is_limited_to_the_allowlist() {
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let node = conn(Role::Node, ScopeSet::default());

        assert!(
            registry
                .authorize(&gateway, &node, "node.invoke.result")
                .is_ok()
        );
        let err = registry.authorize(&gateway, &node, "status").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnauthorizedRole);

        // The allowlist is configuration, not hardcoded.
        let widened = GatewayConfig {
            node_methods: vec!["node.invoke.result".to_string(), "status".to_string()],
            ..GatewayConfig::default()
        };
        assert!(registry.authorize(&widened, &node, "status").is_ok());
    }

    #[test]
    fn unknown_methods_are_rejected() {
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let admin = conn(Role::Operator, ScopeSet::admin());
        let err = registry
            .authorize(&gateway, &admin, "sessions.explode")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownMethod);
    }

    #[tokio::test]
    async fn agents_create_then_conflict() {
        let (runtime, _tmp) = test_runtime();
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let ctx = context(&runtime, conn(Role::Operator, ScopeSet::admin()));

        let outcome = registry
            .dispatch(
                &gateway,
                ctx.clone(),
                "agents.create",
                json!({ "agentId": "home" }),
            )
            .await
            .unwrap();
        let MethodOutcome::Final(payload) = outcome else {
            panic!("expected final payload");
        };
        assert_eq!(payload["key"], "agent:home:main");

        let err = registry
            .dispatch(&gateway, ctx, "agents.create", json!({ "agentId": "home" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn events_roundtrip_through_methods() {
        let (runtime, _tmp) = test_runtime();
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let ctx = context(&runtime, conn(Role::Operator, ScopeSet::admin()));

        registry
            .dispatch(
                &gateway,
                ctx.clone(),
                "events.enqueue",
                json!({ "text": "hello" }),
            )
            .await
            .unwrap();
        let MethodOutcome::Final(payload) = registry
            .dispatch(&gateway, ctx, "events.peek", json!({}))
            .await
            .unwrap()
        else {
            panic!("expected final payload");
        };
        assert_eq!(payload["events"], json!(["hello"]));
    }

    #[tokio::test]
    async fn cron_run_streams_accepted_then_final() {
        let (runtime, _tmp) = test_runtime();
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let ctx = context(&runtime, conn(Role::Operator, ScopeSet::admin()));

        registry
            .dispatch(
                &gateway,
                ctx.clone(),
                "cron.add",
                json!({ "job": {
                    "id": "j1",
                    "name": "ping",
                    "enabled": true,
                    "schedule": { "kind": "every", "everyMs": 60000 },
                    "sessionTarget": "main",
                    "wakeMode": "next-heartbeat",
                    "payload": { "kind": "systemEvent", "text": "ping" }
                }}),
            )
            .await
            .unwrap();

        let outcome = registry
            .dispatch(&gateway, ctx, "cron.run", json!({ "id": "j1" }))
            .await
            .unwrap();
        let MethodOutcome::Accepted { ack, follow } = outcome else {
            panic!("expected accepted outcome");
        };
        assert_eq!(ack["jobId"], "j1");
        let final_payload = follow.await.unwrap();
        assert_eq!(final_payload["status"], "ok");
    }

    #[tokio::test]
    async fn chat_send_surfaces_executor_failures() {
        let (runtime, _tmp) = test_runtime();
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let ctx = context(&runtime, conn(Role::Operator, ScopeSet::admin()));

        // The default runtime has no agent backend wired in.
        let err = registry
            .dispatch(
                &gateway,
                ctx,
                "chat.send",
                json!({ "message": "hello there" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        assert!(err.message.contains("no agent executor"));

        // The session was still created and touched.
        let map = runtime.sessions.load().await.unwrap();
        assert!(map.contains_key(&SessionKey::main("main")));
    }

    #[tokio::test]
    async fn node_invoke_times_out_when_node_never_answers() {
        let (runtime, _tmp) = test_runtime();
        let registry = MethodRegistry::standard();
        let gateway = GatewayConfig::default();
        let ctx = context(&runtime, conn(Role::Operator, ScopeSet::admin()));

        struct SwallowingLink;
        impl GatewayLink for SwallowingLink {
            fn send_event_to(&self, _conn_id: Uuid, _event: &str, _payload: Value) -> bool {
                true // delivered, but the node never replies
            }
            fn broadcast_event(&self, _event: &str, _payload: Value) {}
        }
        let ctx = MethodContext {
            link: Arc::new(SwallowingLink),
            ..ctx
        };

        runtime.nodes.register(
            "phone",
            Uuid::new_v4(),
            "Phone",
            "ios",
            vec![],
            vec![],
            Value::Null,
        );

        let err = registry
            .dispatch(
                &gateway,
                ctx,
                "node.invoke",
                json!({ "nodeId": "phone", "command": "camera.capture", "timeoutMs": 50 }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
    }
}
