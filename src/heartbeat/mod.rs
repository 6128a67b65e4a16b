//! Heartbeat coordination.
//!
//! `wake` holds the coalesced single-wake loop, `runner` the gate sequence
//! and agent re-entry. This module owns the per-agent interval registry and
//! the timer that turns elapsed intervals into wake requests.

pub mod runner;
pub mod wake;

pub use runner::{HeartbeatEvent, HeartbeatRunner};
pub use wake::{
    DEFAULT_COALESCE, HeartbeatOutcome, Indicator, SkipReason, WakeCoordinator, WakeHandler,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::debug;

use crate::config::HeartbeatConfig;
use crate::util::time::now_ms;

/// Ceiling on any single timer sleep; defends against clock jumps.
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(60);
/// Pace for re-checking agents that stay overdue (gate-skipped).
const OVERDUE_RECHECK: Duration = Duration::from_secs(1);

struct AgentState {
    config: HeartbeatConfig,
    last_run_ms: Option<i64>,
    next_due_ms: i64,
}

/// Per-agent heartbeat registry plus the interval timer.
pub struct Heartbeats {
    agents: Mutex<HashMap<String, AgentState>>,
    wake: OnceLock<Arc<WakeCoordinator>>,
    timer_gen: AtomicU64,
}

impl Heartbeats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: Mutex::new(HashMap::new()),
            wake: OnceLock::new(),
            timer_gen: AtomicU64::new(0),
        })
    }

    /// Attach the wake coordinator the timer fires into.
    pub fn attach_wake(self: &Arc<Self>, wake: Arc<WakeCoordinator>) {
        let _ = self.wake.set(wake);
        self.arm_timer();
    }

    /// Register (or replace) an agent. A new agent is due immediately.
    pub fn register(self: &Arc<Self>, agent_id: &str, config: HeartbeatConfig) {
        {
            let mut agents = self.agents.lock().unwrap();
            agents.insert(
                agent_id.to_string(),
                AgentState {
                    config,
                    last_run_ms: None,
                    next_due_ms: now_ms(),
                },
            );
        }
        self.arm_timer();
    }

    pub fn remove(self: &Arc<Self>, agent_id: &str) {
        self.agents.lock().unwrap().remove(agent_id);
        self.arm_timer();
    }

    /// Ids of all registered agents.
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.lock().unwrap().keys().cloned().collect()
    }

    pub fn config_of(&self, agent_id: &str) -> Option<HeartbeatConfig> {
        self.agents
            .lock()
            .unwrap()
            .get(agent_id)
            .map(|s| s.config.clone())
    }

    /// Whether an agent's interval has elapsed.
    pub fn is_due(&self, agent_id: &str, now: i64) -> bool {
        self.agents
            .lock()
            .unwrap()
            .get(agent_id)
            .map(|s| s.config.enabled && s.next_due_ms <= now)
            .unwrap_or(false)
    }

    /// Record a completed consideration of a due agent and push its next
    /// due time forward.
    pub fn mark_ran(self: &Arc<Self>, agent_id: &str) {
        {
            let mut agents = self.agents.lock().unwrap();
            if let Some(state) = agents.get_mut(agent_id) {
                let now = now_ms();
                state.last_run_ms = Some(now);
                state.next_due_ms = now + state.config.every.as_millis() as i64;
            }
        }
        self.arm_timer();
    }

    /// Arm a single timer at the earliest due time across enabled agents,
    /// clamped to [`MAX_TIMER_SLEEP`].
    fn arm_timer(self: &Arc<Self>) {
        let Some(wake) = self.wake.get().cloned() else {
            return;
        };
        let next_due = {
            let agents = self.agents.lock().unwrap();
            agents
                .values()
                .filter(|s| s.config.enabled && !s.config.every.is_zero())
                .map(|s| s.next_due_ms)
                .min()
        };
        let Some(next_due) = next_due else {
            return;
        };

        let raw = (next_due - now_ms()).max(0) as u64;
        let mut delay = Duration::from_millis(raw).min(MAX_TIMER_SLEEP);
        if delay.is_zero() {
            delay = OVERDUE_RECHECK;
        }

        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.timer_gen.load(Ordering::SeqCst) != generation {
                return; // a newer timer superseded this one
            }
            debug!("Heartbeat interval timer fired");
            wake.request_within("interval", Duration::ZERO);
            this.arm_timer();
        });
    }
}
