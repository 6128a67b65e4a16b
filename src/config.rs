//! Configuration types.
//!
//! Plain structs with `Default` impls and `from_env()` constructors; the
//! core reads environment variables directly and leaves config-file parsing
//! to the outer layers.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

/// Default gateway TCP port.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Resolve the state directory.
///
/// `OPENCLAW_STATE_DIR` wins; otherwise `$HOME/.openclaw[-<profile>]` where
/// `<profile>` comes from `OPENCLAW_PROFILE`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("OPENCLAW_STATE_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let suffix = match std::env::var("OPENCLAW_PROFILE") {
        Ok(profile) if !profile.trim().is_empty() => format!(".openclaw-{}", profile.trim()),
        _ => ".openclaw".to_string(),
    };
    PathBuf::from(home).join(suffix)
}

/// Which interfaces the gateway listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindScope {
    /// 127.0.0.1 and ::1 only.
    Loopback,
    /// All interfaces.
    All,
}

/// Gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Bind scope.
    pub bind: BindScope,
    /// Shared auth token, if configured.
    pub auth_token: Option<SecretString>,
    /// Shared auth password, if configured.
    pub auth_password: Option<SecretString>,
    /// Origins allowed for browser (`platform:"web"`) clients.
    pub allowed_origins: Vec<String>,
    /// Direct peers trusted to set forwarded-for headers.
    pub trusted_proxies: Vec<IpAddr>,
    /// Accept Tailscale identity headers as the principal.
    pub allow_tailscale: bool,
    /// Methods a `node`-role connection may invoke.
    pub node_methods: Vec<String>,
    /// Handshake must complete within this window.
    pub handshake_timeout: Duration,
    /// Keep-alive tick interval.
    pub tick_interval: Duration,
    /// Bounded wait for in-flight handlers on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_GATEWAY_PORT,
            bind: BindScope::Loopback,
            auth_token: None,
            auth_password: None,
            allowed_origins: Vec::new(),
            trusted_proxies: Vec::new(),
            allow_tailscale: false,
            node_methods: vec!["node.invoke.result".to_string()],
            handshake_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    /// Build gateway config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("OPENCLAW_GATEWAY_PORT")
            && let Ok(port) = port.parse()
        {
            config.port = port;
        }
        if let Ok(bind) = std::env::var("OPENCLAW_GATEWAY_BIND") {
            config.bind = match bind.as_str() {
                "all" => BindScope::All,
                _ => BindScope::Loopback,
            };
        }
        if let Ok(token) = std::env::var("OPENCLAW_GATEWAY_TOKEN")
            && !token.is_empty()
        {
            config.auth_token = Some(SecretString::from(token));
        }
        if let Ok(password) = std::env::var("OPENCLAW_GATEWAY_PASSWORD")
            && !password.is_empty()
        {
            config.auth_password = Some(SecretString::from(password));
        }
        if let Ok(origins) = std::env::var("OPENCLAW_ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(proxies) = std::env::var("OPENCLAW_TRUSTED_PROXIES") {
            config.trusted_proxies = proxies
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        if let Ok(v) = std::env::var("OPENCLAW_ALLOW_TAILSCALE") {
            config.allow_tailscale = v == "1" || v == "true";
        }

        config
    }
}

/// Active-hours window in minutes-of-day, local to `timezone`.
///
/// The window is `[start, end)`; when `end <= start` it wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveHours {
    pub start_minute: u16,
    pub end_minute: u16,
    /// IANA zone name, e.g. `America/New_York`.
    pub timezone: String,
}

/// Per-agent heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Whether this agent's heartbeat is enabled.
    pub enabled: bool,
    /// Interval between heartbeat runs.
    pub every: Duration,
    /// Prompt override; `None` uses the standard heartbeat prompt.
    pub prompt: Option<String>,
    /// Delivery target override (session key string); `None` resolves from
    /// the agent's main session.
    pub target: Option<String>,
    /// Model override passed through to the executor.
    pub model: Option<String>,
    /// Maximum characters of an OK-token acknowledgement to surface.
    pub ack_max_chars: usize,
    /// Include reasoning blocks in the outbound payload.
    pub include_reasoning: bool,
    /// Only run within this window, if set.
    pub active_hours: Option<ActiveHours>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every: Duration::from_secs(30 * 60),
            prompt: None,
            target: None,
            model: None,
            ack_max_chars: 300,
            include_reasoning: false,
            active_hours: None,
        }
    }
}

/// What heartbeat output is allowed to reach the user.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatVisibility {
    pub show_alerts: bool,
    pub show_ok: bool,
    pub use_indicator: bool,
}

impl Default for HeartbeatVisibility {
    fn default() -> Self {
        Self {
            show_alerts: true,
            show_ok: false,
            use_indicator: true,
        }
    }
}

impl HeartbeatVisibility {
    /// Whether any outbound path is open at all.
    pub fn permits_sending(&self) -> bool {
        self.show_alerts || self.show_ok || self.use_indicator
    }
}

/// Cron scheduler configuration.
#[derive(Debug, Clone)]
pub struct CronConfig {
    /// Default per-job execution timeout.
    pub default_timeout: Duration,
    /// How long ephemeral `cron:*` session entries are retained.
    /// `None` disables the reaper.
    pub ephemeral_retention: Option<Duration>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(600),
            ephemeral_retention: Some(Duration::from_secs(24 * 3600)),
        }
    }
}

impl CronConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("OPENCLAW_CRON_RETENTION_HOURS") {
            config.ephemeral_retention = match v.as_str() {
                "false" | "never" => None,
                other => other
                    .parse::<u64>()
                    .ok()
                    .map(|h| Duration::from_secs(h * 3600))
                    .or(config.ephemeral_retention),
            };
        }
        config
    }
}

/// Root configuration for the core runtime.
#[derive(Clone)]
pub struct CoreConfig {
    pub state_dir: PathBuf,
    /// The default agent whose main session receives runtime work.
    pub agent_id: String,
    pub gateway: GatewayConfig,
    pub cron: CronConfig,
    /// Global heartbeat kill switch.
    pub heartbeats_enabled: bool,
    pub heartbeat_visibility: HeartbeatVisibility,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: state_dir(),
            agent_id: std::env::var("OPENCLAW_AGENT_ID").unwrap_or_else(|_| "main".to_string()),
            gateway: GatewayConfig::from_env(),
            cron: CronConfig::from_env(),
            heartbeats_enabled: std::env::var("OPENCLAW_HEARTBEATS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            heartbeat_visibility: HeartbeatVisibility::default(),
        }
    }

    /// Path of the session store file.
    pub fn sessions_path(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    /// Path of the cron job store file.
    pub fn cron_jobs_path(&self) -> PathBuf {
        self.state_dir.join("cron").join("jobs.json")
    }

    /// Path of an agent's heartbeat checklist.
    pub fn heartbeat_file(&self, agent_id: &str) -> PathBuf {
        self.state_dir
            .join("agents")
            .join(agent_id)
            .join("HEARTBEAT.md")
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            state_dir: state_dir(),
            agent_id: "main".to_string(),
            gateway: GatewayConfig::default(),
            cron: CronConfig::default(),
            heartbeats_enabled: true,
            heartbeat_visibility: HeartbeatVisibility::default(),
        }
    }
}
