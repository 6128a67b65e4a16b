//! The heartbeat handler: gates, prompt construction, agent re-entry.
//!
//! A wake walks every registered agent through the gate sequence; agents
//! that pass have their system events drained, get one agent turn on the
//! `main` lane, and the result is classified and routed. Skipped agents
//! consume nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{ActiveHours, CoreConfig};
use crate::events::{SystemEvent, SystemEventQueue};
use crate::executor::{AgentExecutor, RunRequest};
use crate::heartbeat::Heartbeats;
use crate::heartbeat::wake::{HeartbeatOutcome, SkipReason, WakeHandler};
use crate::lanes::{CommandLanes, lane};
use crate::session::{SessionKey, SessionStore};
use crate::util::time::{clock_hhmmss, minute_of_day_in, now_ms};

/// The token an agent replies with when nothing needs attention.
pub const HEARTBEAT_OK_TOKEN: &str = "HEARTBEAT_OK";

/// Identical outbound content per (agent, target) is suppressed within
/// this window.
const DUP_SUPPRESS_MS: i64 = 24 * 3600 * 1000;

const DEFAULT_PROMPT: &str = "Read the heartbeat checklist below and work through it. \
     Do not repeat old work. \
     If nothing needs attention, reply EXACTLY with: HEARTBEAT_OK. \
     Otherwise reply with a concise summary of what needs action.";

const CRON_EVENT_PROMPT: &str = "A scheduled job fired. Carry out what the system events \
     below ask for. \
     If nothing needs attention afterwards, reply EXACTLY with: HEARTBEAT_OK.";

const EXEC_EVENT_PROMPT: &str = "A background command finished. Review the system events \
     below and report anything that needs attention. \
     If nothing does, reply EXACTLY with: HEARTBEAT_OK.";

/// Outcome of one agent's heartbeat, published for the gateway to forward.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub agent_id: String,
    pub reason: String,
    pub status: &'static str,
    pub indicator: &'static str,
    pub target: Option<String>,
    pub content: Option<String>,
}

/// Everything the runner needs, handed in at startup.
pub struct HeartbeatDeps {
    pub config: CoreConfig,
    pub registry: Arc<Heartbeats>,
    pub lanes: Arc<CommandLanes>,
    pub events: Arc<SystemEventQueue>,
    pub sessions: Arc<SessionStore>,
    pub executor: Arc<dyn AgentExecutor>,
}

pub struct HeartbeatRunner {
    deps: HeartbeatDeps,
    /// (agent, target) -> (content digest, first-seen ms).
    recent: Mutex<HashMap<(String, String), (String, i64)>>,
    events_tx: broadcast::Sender<HeartbeatEvent>,
}

impl HeartbeatRunner {
    pub fn new(deps: HeartbeatDeps) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            deps,
            recent: Mutex::new(HashMap::new()),
            events_tx,
        })
    }

    /// Subscribe to per-agent heartbeat outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events_tx.subscribe()
    }

    async fn run_agent(
        &self,
        agent_id: &str,
        reason: &str,
        now: i64,
    ) -> (HeartbeatOutcome, Option<String>, Option<String>) {
        let Some(config) = self.deps.registry.config_of(agent_id) else {
            return (
                HeartbeatOutcome::Skipped(SkipReason::AgentDisabled),
                None,
                None,
            );
        };
        if !config.enabled {
            return (
                HeartbeatOutcome::Skipped(SkipReason::AgentDisabled),
                None,
                None,
            );
        }
        if config.every.is_zero() {
            return (
                HeartbeatOutcome::Skipped(SkipReason::InvalidInterval),
                None,
                None,
            );
        }
        if let Some(hours) = &config.active_hours
            && !within_active_hours(hours, now)
        {
            return (
                HeartbeatOutcome::Skipped(SkipReason::OutsideActiveHours),
                None,
                None,
            );
        }

        let main_key = SessionKey::main(agent_id);
        let pending = self.deps.events.len(&main_key).await;
        if pending == 0 && !self.deps.registry.is_due(agent_id, now) {
            return (HeartbeatOutcome::Skipped(SkipReason::NotDue), None, None);
        }

        // Backpressure: never re-enter the agent while operator work is
        // queued or running on the main lane.
        if self.deps.lanes.queue_size(Some(lane::MAIN)) > 0 {
            return (
                HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight),
                None,
                None,
            );
        }

        let checklist = self.read_checklist(agent_id).await;
        if pending == 0 && checklist.is_none() {
            return (
                HeartbeatOutcome::Skipped(SkipReason::NothingToDo),
                None,
                None,
            );
        }

        let Some(target) = self.resolve_target(&config.target, &main_key).await else {
            return (
                HeartbeatOutcome::Skipped(SkipReason::NoDeliveryTarget),
                None,
                None,
            );
        };
        if !self.deps.config.heartbeat_visibility.permits_sending() {
            return (
                HeartbeatOutcome::Skipped(SkipReason::HiddenByVisibility),
                Some(target),
                None,
            );
        }

        // All gates passed: consume the events and build the prompt.
        let events = self.deps.events.drain(&main_key).await;
        let prompt = build_prompt(&config.prompt, &events, reason, checklist.as_deref());

        let session_id = match self
            .deps
            .sessions
            .update(|map| {
                let entry = map.entry(main_key.clone()).or_default();
                entry.touch();
                entry.session_id
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(agent = agent_id, error = %e, "Heartbeat could not open session");
                return (HeartbeatOutcome::Failed(e.to_string()), Some(target), None);
            }
        };

        let mut request = RunRequest::new(session_id, main_key.clone(), prompt);
        request.model = config.model.clone();
        let executor = Arc::clone(&self.deps.executor);
        let ticket = self
            .deps
            .lanes
            .enqueue(lane::MAIN, async move { executor.run(request).await });

        let outcome = match ticket.join().await {
            Err(e) => return (HeartbeatOutcome::Failed(e.to_string()), Some(target), None),
            Ok(Err(e)) => return (HeartbeatOutcome::Failed(e.to_string()), Some(target), None),
            Ok(Ok(outcome)) => outcome,
        };

        if let Err(e) = self
            .deps
            .sessions
            .update(|map| {
                let entry = map.entry(main_key.clone()).or_default();
                entry.usage.absorb(outcome.usage.input, outcome.usage.output);
                entry.touch();
            })
            .await
        {
            warn!(agent = agent_id, error = %e, "Failed to record heartbeat usage");
        }

        let text = outcome.text.trim();
        if text.is_empty() {
            return (HeartbeatOutcome::OkEmpty, Some(target), None);
        }
        if let Some(ack) = extract_ok_token(text, config.ack_max_chars) {
            return (HeartbeatOutcome::OkToken { ack }, Some(target), None);
        }
        if self.is_duplicate(agent_id, &target, text, now) {
            debug!(agent = agent_id, "Suppressed duplicate heartbeat content");
            return (
                HeartbeatOutcome::Skipped(SkipReason::DuplicateContent),
                Some(target),
                None,
            );
        }
        (
            HeartbeatOutcome::Sent,
            Some(target),
            Some(text.to_string()),
        )
    }

    async fn read_checklist(&self, agent_id: &str) -> Option<String> {
        let path = self.deps.config.heartbeat_file(agent_id);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        if is_effectively_empty(&content) {
            None
        } else {
            Some(content)
        }
    }

    /// The configured target wins; otherwise fall back to the main
    /// session's last delivery route.
    async fn resolve_target(
        &self,
        configured: &Option<String>,
        main_key: &SessionKey,
    ) -> Option<String> {
        if let Some(target) = configured {
            return Some(target.clone());
        }
        let map = self.deps.sessions.load().await.ok()?;
        let route = map.get(main_key)?.last_delivery.clone()?;
        if route.is_empty() {
            return None;
        }
        match (&route.channel, &route.to) {
            (Some(channel), Some(to)) => Some(format!("{channel}:{to}")),
            (Some(channel), None) => Some(channel.clone()),
            _ => None,
        }
    }

    fn is_duplicate(&self, agent_id: &str, target: &str, content: &str, now: i64) -> bool {
        let digest = content_digest(content);
        let key = (agent_id.to_string(), target.to_string());
        let mut recent = self.recent.lock().unwrap();
        if let Some((prev_digest, seen_at)) = recent.get(&key)
            && *prev_digest == digest
            && now - seen_at < DUP_SUPPRESS_MS
        {
            return true;
        }
        recent.insert(key, (digest, now));
        false
    }

    fn emit(&self, agent_id: &str, reason: &str, outcome: &HeartbeatOutcome, target: Option<String>, content: Option<String>) {
        let visibility = self.deps.config.heartbeat_visibility;
        let content = match outcome {
            HeartbeatOutcome::Sent if visibility.show_alerts => content,
            HeartbeatOutcome::OkToken { ack }
                if (visibility.show_ok || visibility.use_indicator) && !ack.is_empty() =>
            {
                Some(ack.clone())
            }
            _ => None,
        };
        let _ = self.events_tx.send(HeartbeatEvent {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
            status: outcome.status(),
            indicator: outcome.indicator().as_str(),
            target,
            content,
        });
    }
}

#[async_trait]
impl WakeHandler for HeartbeatRunner {
    async fn on_wake(&self, reason: &str) -> HeartbeatOutcome {
        if !self.deps.config.heartbeats_enabled {
            return HeartbeatOutcome::Skipped(SkipReason::Disabled);
        }

        let now = now_ms();
        let agent_ids = self.deps.registry.agent_ids();
        if agent_ids.is_empty() {
            return HeartbeatOutcome::Skipped(SkipReason::NothingToDo);
        }

        let mut aggregate = HeartbeatOutcome::Skipped(SkipReason::NothingToDo);
        for agent_id in agent_ids {
            let was_due = self.deps.registry.is_due(&agent_id, now);
            let (outcome, target, content) = self.run_agent(&agent_id, reason, now).await;

            // Busy skips keep the agent due so the 1 s retry picks it up.
            if was_due
                && !matches!(
                    outcome,
                    HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight)
                )
            {
                self.deps.registry.mark_ran(&agent_id);
            }

            info!(
                agent = %agent_id,
                reason = %reason,
                status = outcome.status(),
                "Heartbeat considered"
            );
            self.emit(&agent_id, reason, &outcome, target, content);
            aggregate = prefer(aggregate, outcome);
        }
        aggregate
    }
}

/// Pick the outcome the wake coordinator should react to: busy skips first
/// (they schedule the retry), then failures, then real output.
fn prefer(current: HeartbeatOutcome, candidate: HeartbeatOutcome) -> HeartbeatOutcome {
    fn rank(outcome: &HeartbeatOutcome) -> u8 {
        match outcome {
            HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight) => 5,
            HeartbeatOutcome::Failed(_) => 4,
            HeartbeatOutcome::Sent => 3,
            HeartbeatOutcome::OkToken { .. } => 2,
            HeartbeatOutcome::OkEmpty => 1,
            HeartbeatOutcome::Skipped(_) => 0,
        }
    }
    if rank(&candidate) > rank(&current) {
        candidate
    } else {
        current
    }
}

/// Whether `now` falls inside the `[start, end)` window, wrapping past
/// midnight when `end <= start`. An unparseable zone fails open.
fn within_active_hours(hours: &ActiveHours, now: i64) -> bool {
    let Some(minute) = minute_of_day_in(&hours.timezone, now) else {
        warn!(zone = %hours.timezone, "Unknown time zone in active hours, allowing");
        return true;
    };
    if hours.end_minute <= hours.start_minute {
        minute >= hours.start_minute || minute < hours.end_minute
    } else {
        minute >= hours.start_minute && minute < hours.end_minute
    }
}

fn build_prompt(
    prompt_override: &Option<String>,
    events: &[SystemEvent],
    reason: &str,
    checklist: Option<&str>,
) -> String {
    let has_cron = reason.starts_with("cron:")
        || events.iter().any(|e| e.text.starts_with("Cron:"));
    let has_exec = events.iter().any(|e| e.text.starts_with("Exec"));

    let base = if has_cron {
        CRON_EVENT_PROMPT
    } else if has_exec {
        EXEC_EVENT_PROMPT
    } else {
        prompt_override.as_deref().unwrap_or(DEFAULT_PROMPT)
    };

    let mut out = String::new();
    for event in events {
        out.push_str(&format!(
            "System: [{}] {}\n",
            clock_hhmmss(event.ts),
            event.text
        ));
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(base);
    if let Some(checklist) = checklist {
        out.push_str("\n\n## HEARTBEAT.md\n\n");
        out.push_str(checklist);
    }
    out
}

/// Extract the OK-token acknowledgement from a reply, truncated to
/// `max_chars`. Returns `None` when the token is absent.
fn extract_ok_token(text: &str, max_chars: usize) -> Option<String> {
    if !text.contains(HEARTBEAT_OK_TOKEN) {
        return None;
    }
    let ack: String = text
        .replace(HEARTBEAT_OK_TOKEN, "")
        .trim()
        .chars()
        .take(max_chars)
        .collect();
    Some(ack)
}

fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Check if checklist content is effectively empty.
///
/// Returns true when the content contains only whitespace, markdown
/// headers, HTML comments, or blank list items. Skips the agent turn when
/// the user hasn't added real tasks yet.
fn is_effectively_empty(content: &str) -> bool {
    let without_comments = strip_html_comments(content);
    without_comments.lines().all(|line| {
        let trimmed = line.trim();
        trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed == "- [ ]"
            || trimmed == "- [x]"
            || trimmed == "-"
            || trimmed == "*"
    })
}

fn strip_html_comments(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<!--") {
        result.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => return result, // unclosed comment, treat rest as comment
        }
    }
    result.push_str(rest);
    result
}
