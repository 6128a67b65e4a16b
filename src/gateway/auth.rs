//! Connection authentication and scope model.
//!
//! Modes are evaluated in order until one applies: local bypass, Tailscale
//! proxy identity, signed device identity, then shared token or password.
//! Secret comparison is constant-time throughout. Scopes are enforced even
//! when authentication itself is bypassed.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Mutex, RwLock};

use rand::RngCore;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::ErrorCode;
use crate::gateway::frames::{ClientInfo, ConnectParams, DeviceIdentity};
use crate::gateway::methods::MethodError;
use crate::util::time::now_ms;

/// Scope labels.
pub mod scope {
    pub const ADMIN: &str = "operator.admin";
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
    pub const APPROVALS: &str = "operator.approvals";
    pub const PAIRING: &str = "operator.pairing";

    pub const ALL: &[&str] = &[ADMIN, READ, WRITE, APPROVALS, PAIRING];
}

/// Device-signature clock skew tolerance.
const DEVICE_SKEW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Operator,
    Node,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Node => "node",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "node" => Role::Node,
            _ => Role::Operator,
        }
    }
}

/// A connection's granted scopes. `operator.admin` grants everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    pub fn admin() -> Self {
        Self(BTreeSet::from([scope::ADMIN.to_string()]))
    }

    pub fn from_names<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn grants(&self, required: &str) -> bool {
        self.0.contains(scope::ADMIN) || self.0.contains(required)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

/// Authenticated identity attached to a connection after handshake.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub conn_id: Uuid,
    pub role: Role,
    pub scopes: ScopeSet,
    pub client: ClientInfo,
    pub device_id: Option<String>,
    pub authenticated: bool,
    /// Which auth mode admitted the connection.
    pub auth_mode: &'static str,
}

/// HTTP-level facts the auth decision needs.
#[derive(Debug, Clone, Default)]
pub struct PeerFacts {
    pub peer_ip: Option<IpAddr>,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub forwarded_for: Option<String>,
    pub tailscale_user: Option<String>,
}

/// Registered device keys, keyed by device id.
///
/// Keys land here through pairing; persistence of the key material is the
/// outer config layer's concern.
#[derive(Default)]
pub struct DeviceKeyRegistry {
    keys: RwLock<HashMap<String, String>>,
    pending: Mutex<HashMap<String, String>>,
}

impl DeviceKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_id: &str, key: &str) {
        self.keys
            .write()
            .unwrap()
            .insert(device_id.to_string(), key.to_string());
    }

    pub fn key_of(&self, device_id: &str) -> Option<String> {
        self.keys.read().unwrap().get(device_id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.keys.read().unwrap().keys().cloned().collect()
    }

    /// Begin pairing a device: returns the short confirmation code.
    pub fn start_pairing(&self, device_id: &str) -> String {
        let code = pairing_code();
        self.pending
            .lock()
            .unwrap()
            .insert(code.clone(), device_id.to_string());
        code
    }

    /// Complete pairing: registers the key under the device the code was
    /// issued for. Returns the device id, or `None` for an unknown code.
    pub fn confirm_pairing(&self, code: &str, key: &str) -> Option<String> {
        let device_id = self.pending.lock().unwrap().remove(code)?;
        self.register(&device_id, key);
        Some(device_id)
    }
}

/// Generate the 16-byte challenge nonce sent at connection open.
pub fn challenge_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn pairing_code() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Keyed digest over the canonical device payload. The signing side holds
/// the same key, registered at pairing time.
pub fn device_digest(key: &str, identity: &DeviceIdentity) -> String {
    let canonical = format!(
        "{key}|{}|{}|{}|{}|{}|{}",
        identity.device_id,
        identity.client_id,
        identity.role,
        identity.scopes.join(","),
        identity.signed_at_ms,
        identity.token,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Whether the peer qualifies for the local auth bypass: loopback address,
/// localhost Host header, and no forwarded-for unless the direct peer is a
/// trusted proxy.
fn local_bypass(config: &GatewayConfig, facts: &PeerFacts) -> bool {
    let Some(ip) = facts.peer_ip else {
        return false;
    };
    if !ip.is_loopback() {
        return false;
    }
    let host_ok = facts
        .host
        .as_deref()
        .map(|host| {
            let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
            host == "localhost" || host == "127.0.0.1" || host == "[::1]"
        })
        .unwrap_or(false);
    if !host_ok {
        return false;
    }
    facts.forwarded_for.is_none() || config.trusted_proxies.contains(&ip)
}

fn unauthorized(message: &str) -> MethodError {
    MethodError::new(ErrorCode::Unauthorized, message)
}

/// Run the authentication ladder for a handshake.
pub fn authenticate(
    config: &GatewayConfig,
    devices: &DeviceKeyRegistry,
    facts: &PeerFacts,
    params: &ConnectParams,
    challenge: &str,
    conn_id: Uuid,
) -> Result<ConnectionContext, MethodError> {
    let requested_role = Role::parse(
        params
            .role
            .as_deref()
            .or(params.device.as_ref().map(|d| d.role.as_str()))
            .unwrap_or("operator"),
    );
    let requested_scopes = params.scopes.clone();

    let grant = |granted: ScopeSet, authenticated: bool, mode: &'static str| {
        let scopes = match &requested_scopes {
            // Never grant more than the auth mode allows.
            Some(names) => ScopeSet::from_names(
                names.iter().filter(|name| granted.grants(name)).cloned(),
            ),
            None => granted,
        };
        ConnectionContext {
            conn_id,
            role: requested_role,
            scopes,
            client: params.client.clone(),
            device_id: params.device.as_ref().map(|d| d.device_id.clone()),
            authenticated,
            auth_mode: mode,
        }
    };

    // 1. Local bypass: authentication skipped, scopes still enforced.
    if local_bypass(config, facts) {
        return Ok(grant(ScopeSet::admin(), false, "local"));
    }

    // 2. Tailscale-proxied identity.
    if config.allow_tailscale && facts.tailscale_user.is_some() {
        return Ok(grant(ScopeSet::admin(), true, "tailscale"));
    }

    // 3. Signed device identity.
    if let Some(device) = &params.device {
        let key = devices
            .key_of(&device.device_id)
            .ok_or_else(|| unauthorized("unknown device"))?;
        verify_device(&key, device, challenge)?;
        let granted = ScopeSet::from_names(device.scopes.clone());
        return Ok(grant(granted, true, "device"));
    }

    // 4. Shared token / password, compared in constant time.
    if let Some(auth) = &params.auth {
        if let (Some(presented), Some(expected)) = (&auth.token, &config.auth_token)
            && ct_eq(presented, expected.expose_secret())
        {
            return Ok(grant(ScopeSet::admin(), true, "token"));
        }
        if let (Some(presented), Some(expected)) = (&auth.password, &config.auth_password)
            && ct_eq(presented, expected.expose_secret())
        {
            return Ok(grant(ScopeSet::admin(), true, "password"));
        }
    }

    Err(unauthorized("authentication required"))
}

/// Validate a device identity block against its registered key.
pub fn verify_device(
    key: &str,
    identity: &DeviceIdentity,
    challenge: &str,
) -> Result<(), MethodError> {
    if !ct_eq(&identity.token, challenge) {
        return Err(unauthorized("challenge mismatch"));
    }
    let skew = (now_ms() - identity.signed_at_ms).abs();
    if skew > DEVICE_SKEW_MS {
        return Err(unauthorized("device signature expired"));
    }
    let expected = device_digest(key, identity);
    if !ct_eq(&identity.signature, &expected) {
        return Err(unauthorized("bad device signature"));
    }
    Ok(())
}

/// Origin allowlist check for browser clients.
pub fn origin_allowed(config: &GatewayConfig, client: &ClientInfo, origin: Option<&str>) -> bool {
    if client.platform != "web" {
        return true;
    }
    match origin {
        Some(origin) => config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin),
        None => false,
    }
}
