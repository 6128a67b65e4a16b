//! The cron timer engine.
//!
//! Owns the persistent job table. Startup recovers crash markers and
//! replays missed runs; afterwards a single re-arming timer marks due jobs
//! running and dispatches them on the `cron` lane, each wrapped in a
//! timeout. Completion records run state, applies error backoff, persists,
//! sweeps ephemeral sessions, and re-arms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CronConfig;
use crate::cron::schedule::{backoff_ms, next_run_at};
use crate::cron::store::CronStore;
use crate::cron::types::{
    CronJob, CronPayload, Delivery, DeliveryMode, RunStatus, Schedule, SessionTarget, WakeMode,
};
use crate::error::CronError;
use crate::events::SystemEventQueue;
use crate::executor::{AgentExecutor, RunRequest};
use crate::heartbeat::WakeCoordinator;
use crate::lanes::{CommandLanes, lane};
use crate::session::{SessionKey, SessionStore};
use crate::util::time::now_ms;

/// Ceiling on any single timer sleep; defends against clock jumps.
const MAX_TIMER_SLEEP_MS: i64 = 60_000;
/// A running marker older than this is treated as stuck.
const STUCK_RUN_MS: i64 = 2 * 3600 * 1000;
/// Minimum spacing between ephemeral-session sweeps.
const SWEEP_EVERY_MS: i64 = 5 * 60 * 1000;
/// How long a `wakeMode: now` job waits for the main lane to drain.
const MAIN_DRAIN_WAIT: Duration = Duration::from_secs(120);

/// Fallback event text for payloads with nothing to say.
const DEFAULT_REMINDER: &str = "scheduled reminder";

/// Observable job lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronAction {
    Added,
    Updated,
    Removed,
    Started,
    Finished,
}

impl CronAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CronAction::Added => "added",
            CronAction::Updated => "updated",
            CronAction::Removed => "removed",
            CronAction::Started => "started",
            CronAction::Finished => "finished",
        }
    }
}

/// One lifecycle event, broadcast to observers (the gateway forwards them).
#[derive(Debug, Clone)]
pub struct CronEvent {
    pub job_id: String,
    pub action: CronAction,
    pub status: Option<RunStatus>,
    pub error: Option<String>,
}

/// An isolated run's announced result, routed toward a channel adapter.
#[derive(Debug, Clone)]
pub struct CronDelivery {
    pub job_id: String,
    pub channel: String,
    pub to: Option<String>,
    pub text: String,
}

/// Partial update applied by `cron.update`.
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub delete_after_run: Option<bool>,
    pub schedule: Option<Schedule>,
    pub session_target: Option<SessionTarget>,
    pub wake_mode: Option<WakeMode>,
    pub payload: Option<CronPayload>,
    pub delivery: Option<Option<Delivery>>,
}

/// Everything the scheduler needs, handed in at startup.
pub struct CronSchedulerDeps {
    pub config: CronConfig,
    pub store_path: PathBuf,
    /// Agent whose main session receives `main`-target payloads.
    pub agent_id: String,
    pub lanes: Arc<CommandLanes>,
    pub events: Arc<SystemEventQueue>,
    pub wake: Arc<WakeCoordinator>,
    pub sessions: Arc<SessionStore>,
    pub executor: Arc<dyn AgentExecutor>,
}

pub struct CronScheduler {
    deps: CronSchedulerDeps,
    store: CronStore,
    jobs: Mutex<Vec<CronJob>>,
    events_tx: broadcast::Sender<CronEvent>,
    delivery_tx: broadcast::Sender<CronDelivery>,
    timer_gen: AtomicU64,
    last_sweep_ms: StdMutex<i64>,
}

impl CronScheduler {
    pub fn new(deps: CronSchedulerDeps) -> Arc<Self> {
        let store = CronStore::new(&deps.store_path);
        let (events_tx, _) = broadcast::channel(64);
        let (delivery_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            deps,
            store,
            jobs: Mutex::new(Vec::new()),
            events_tx,
            delivery_tx,
            timer_gen: AtomicU64::new(0),
            last_sweep_ms: StdMutex::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CronEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<CronDelivery> {
        self.delivery_tx.subscribe()
    }

    /// Load the table, recover crash markers, replay missed jobs, recompute
    /// schedules, persist, and arm the timer.
    pub async fn start(self: &Arc<Self>) -> Result<(), CronError> {
        let loaded = self.store.load().await?;
        let now = now_ms();

        let missed_ids = {
            let mut jobs = self.jobs.lock().await;
            *jobs = loaded;

            for job in jobs.iter_mut() {
                if let Some(running_at) = job.state.running_at_ms {
                    if now - running_at > STUCK_RUN_MS {
                        warn!(job_id = %job.id, "Clearing stuck running marker");
                    } else {
                        warn!(job_id = %job.id, "Run interrupted by restart");
                    }
                    job.state.running_at_ms = None;
                }
            }

            let mut missed: Vec<(i64, String)> = jobs
                .iter()
                .filter(|job| job.enabled)
                .filter_map(|job| match job.state.next_run_at_ms {
                    Some(next) if next <= now => Some((next, job.id.clone())),
                    _ => match &job.schedule {
                        Schedule::At { at }
                            if at.timestamp_millis() <= now
                                && job.state.last_run_at_ms.is_none() =>
                        {
                            Some((at.timestamp_millis(), job.id.clone()))
                        }
                        _ => None,
                    },
                })
                .collect();
            missed.sort();
            missed.into_iter().map(|(_, id)| id).collect::<Vec<_>>()
        };

        if !missed_ids.is_empty() {
            info!(count = missed_ids.len(), "Replaying missed cron jobs");
        }
        // Missed runs collapse to a single execution each, in next-run order.
        for job_id in missed_ids {
            self.run_to_completion(&job_id).await;
        }

        {
            let mut jobs = self.jobs.lock().await;
            let now = now_ms();
            for job in jobs.iter_mut() {
                if job.enabled && job.state.running_at_ms.is_none() {
                    match next_run_at(&job.schedule, job.state.last_run_at_ms, now) {
                        Ok(next) => job.state.next_run_at_ms = next,
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Disabling job with bad schedule");
                            job.enabled = false;
                            job.state.next_run_at_ms = None;
                        }
                    }
                }
            }
        }

        self.persist().await?;
        self.arm_timer();
        Ok(())
    }

    /// Add a job. An empty id is replaced with a fresh UUID; runtime state
    /// is reset and the first run computed from now.
    pub async fn add_job(self: &Arc<Self>, mut job: CronJob) -> Result<CronJob, CronError> {
        if job.id.trim().is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        job.state = Default::default();
        if job.enabled {
            job.state.next_run_at_ms = next_run_at(&job.schedule, None, now_ms())?;
        }

        {
            let mut jobs = self.jobs.lock().await;
            if jobs.iter().any(|j| j.id == job.id) {
                return Err(CronError::InvalidSchedule {
                    reason: format!("job id {} already exists", job.id),
                });
            }
            jobs.push(job.clone());
        }
        self.persist().await?;
        self.emit(&job.id, CronAction::Added, None, None);
        self.arm_timer();
        Ok(job)
    }

    pub async fn update_job(self: &Arc<Self>, id: &str, patch: JobPatch) -> Result<CronJob, CronError> {
        let updated = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| CronError::UnknownJob { id: id.to_string() })?;

            if let Some(name) = patch.name {
                job.name = name;
            }
            if let Some(description) = patch.description {
                job.description = description;
            }
            if let Some(delete_after_run) = patch.delete_after_run {
                job.delete_after_run = delete_after_run;
            }
            if let Some(session_target) = patch.session_target {
                job.session_target = session_target;
            }
            if let Some(wake_mode) = patch.wake_mode {
                job.wake_mode = wake_mode;
            }
            if let Some(payload) = patch.payload {
                job.payload = payload;
            }
            if let Some(delivery) = patch.delivery {
                job.delivery = delivery;
            }
            let reschedule = patch.schedule.is_some() || patch.enabled.is_some();
            if let Some(schedule) = patch.schedule {
                job.schedule = schedule;
            }
            if let Some(enabled) = patch.enabled {
                job.enabled = enabled;
            }
            if reschedule {
                job.state.next_run_at_ms = if job.enabled {
                    next_run_at(&job.schedule, job.state.last_run_at_ms, now_ms())?
                } else {
                    None
                };
            }
            job.clone()
        };

        self.persist().await?;
        self.emit(id, CronAction::Updated, None, None);
        self.arm_timer();
        Ok(updated)
    }

    pub async fn remove_job(self: &Arc<Self>, id: &str) -> Result<(), CronError> {
        {
            let mut jobs = self.jobs.lock().await;
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            if jobs.len() == before {
                return Err(CronError::UnknownJob { id: id.to_string() });
            }
        }
        self.persist().await?;
        self.emit(id, CronAction::Removed, None, None);
        Ok(())
    }

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn get_job(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().await.iter().find(|j| j.id == id).cloned()
    }

    /// Run a job immediately, regardless of its schedule. Resolves when the
    /// run completes.
    pub async fn run_now(self: &Arc<Self>, id: &str) -> Result<RunStatus, CronError> {
        if self.get_job(id).await.is_none() {
            return Err(CronError::UnknownJob { id: id.to_string() });
        }
        Ok(self.run_to_completion(id).await)
    }

    /// Single re-arming timer at the earliest next-run, capped at 60 s.
    fn arm_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            let next = {
                let jobs = this.jobs.lock().await;
                jobs.iter()
                    .filter(|j| j.enabled && j.state.running_at_ms.is_none())
                    .filter_map(|j| j.state.next_run_at_ms)
                    .min()
            };
            let Some(next) = next else {
                return;
            };

            let delay = (next - now_ms()).clamp(0, MAX_TIMER_SLEEP_MS) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if this.timer_gen.load(Ordering::SeqCst) != generation {
                return; // a newer timer superseded this one
            }
            this.tick().await;
        });
    }

    async fn tick(self: &Arc<Self>) {
        let now = now_ms();
        let due_ids = {
            let mut jobs = self.jobs.lock().await;
            for job in jobs.iter_mut() {
                if let Some(running_at) = job.state.running_at_ms
                    && now - running_at > STUCK_RUN_MS
                {
                    warn!(job_id = %job.id, "Clearing stuck running marker");
                    job.state.running_at_ms = None;
                }
            }
            jobs.iter()
                .filter(|j| {
                    j.enabled
                        && j.state.running_at_ms.is_none()
                        && j.state.next_run_at_ms.is_some_and(|next| next <= now)
                })
                .map(|j| j.id.clone())
                .collect::<Vec<_>>()
        };

        debug!(due = due_ids.len(), "Cron tick");
        for job_id in due_ids {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_to_completion(&job_id).await;
            });
        }
        self.arm_timer();
    }

    /// Mark a job running, execute it on the `cron` lane under its timeout,
    /// then record the result and reschedule.
    async fn run_to_completion(self: &Arc<Self>, job_id: &str) -> RunStatus {
        let started = now_ms();
        let snapshot = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
                return RunStatus::Skipped;
            };
            if !job.enabled || job.state.running_at_ms.is_some() {
                return RunStatus::Skipped;
            }
            job.state.running_at_ms = Some(started);
            job.clone()
        };
        if let Err(e) = self.persist().await {
            warn!(job_id, error = %e, "Failed to persist running marker");
        }
        self.emit(job_id, CronAction::Started, None, None);

        let timeout = snapshot
            .timeout_override_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.deps.config.default_timeout);
        let this = Arc::clone(self);
        let job_for_exec = snapshot.clone();
        let ticket = self.deps.lanes.enqueue(lane::CRON, async move {
            match tokio::time::timeout(timeout, this.execute_payload(job_for_exec)).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {timeout:?}")),
            }
        });

        let result = match ticket.join().await {
            Ok(result) => result,
            Err(e) => Err(e.to_string()),
        };
        let ended = now_ms();
        let (status, error) = match result {
            Ok(_) => (RunStatus::Ok, None),
            Err(reason) => {
                warn!(job_id, error = %reason, "Cron job failed");
                (RunStatus::Error, Some(reason))
            }
        };

        let deleted = {
            let mut jobs = self.jobs.lock().await;
            match jobs.iter_mut().find(|j| j.id == job_id) {
                Some(job) => {
                    job.state.running_at_ms = None;
                    job.state.last_run_at_ms = Some(ended);
                    job.state.last_status = Some(status);
                    job.state.last_error = error.clone();
                    job.state.last_duration_ms = Some(ended - started);
                    job.state.consecutive_errors = match status {
                        RunStatus::Ok => 0,
                        _ => job.state.consecutive_errors + 1,
                    };

                    match &job.schedule {
                        // One-shots never retry: disable (or delete) either way.
                        Schedule::At { .. } => {
                            job.enabled = false;
                            job.state.next_run_at_ms = None;
                            status == RunStatus::Ok && job.delete_after_run
                        }
                        _ => {
                            job.state.next_run_at_ms = reschedule_after(
                                &job.schedule,
                                status,
                                job.state.consecutive_errors,
                                ended,
                            );
                            false
                        }
                    }
                }
                None => false,
            }
        };
        if deleted {
            let mut jobs = self.jobs.lock().await;
            jobs.retain(|j| j.id != job_id);
        }

        if let Err(e) = self.persist().await {
            warn!(job_id, error = %e, "Failed to persist run result");
        }
        self.emit(job_id, CronAction::Finished, Some(status), error);
        if deleted {
            self.emit(job_id, CronAction::Removed, None, None);
        }
        self.sweep_ephemeral().await;
        self.arm_timer();
        status
    }

    async fn execute_payload(self: Arc<Self>, job: CronJob) -> Result<Option<String>, String> {
        match job.session_target {
            SessionTarget::Main => self.execute_main(&job).await,
            SessionTarget::Isolated => self.execute_isolated(&job).await,
        }
    }

    /// Main target: drop a system event into the agent's main session and
    /// optionally wake the heartbeat right away.
    async fn execute_main(&self, job: &CronJob) -> Result<Option<String>, String> {
        let text = match &job.payload {
            CronPayload::SystemEvent { text } => text.clone(),
            CronPayload::AgentTurn { message, .. } => message.clone(),
        };
        let text = if text.trim().is_empty() {
            DEFAULT_REMINDER.to_string()
        } else {
            text
        };

        let main_key = SessionKey::main(&self.deps.agent_id);
        self.deps.events.enqueue(&main_key, &text).await;

        if job.wake_mode == WakeMode::Now {
            self.deps.wake.request(&format!("cron:{}", job.id));
            // Best effort: give the resulting agent run a window to drain.
            self.deps
                .lanes
                .wait_idle(lane::MAIN, MAIN_DRAIN_WAIT)
                .await;
        }
        Ok(None)
    }

    /// Isolated target: mint a one-off session, run the agent turn through
    /// the facade, and route the final text per the delivery config.
    async fn execute_isolated(&self, job: &CronJob) -> Result<Option<String>, String> {
        let run_key = SessionKey::isolated_run(&job.id);
        let label = job.name.clone();
        let session_id = self
            .deps
            .sessions
            .update(|map| {
                let entry = map.entry(run_key.clone()).or_default();
                entry.origin = Some("cron".to_string());
                entry.label = Some(label);
                entry.touch();
                entry.session_id
            })
            .await
            .map_err(|e| format!("failed to create isolated session: {e}"))?;

        let (prompt, model, thinking) = match &job.payload {
            CronPayload::SystemEvent { text } => (text.clone(), None, None),
            CronPayload::AgentTurn {
                message,
                model,
                thinking,
                ..
            } => (message.clone(), model.clone(), thinking.clone()),
        };

        let mut request = RunRequest::new(session_id, run_key.clone(), prompt);
        request.model = model;
        request.think_level = thinking;
        let outcome = self
            .deps
            .executor
            .run(request)
            .await
            .map_err(|e| e.to_string())?;

        if let Err(e) = self
            .deps
            .sessions
            .update(|map| {
                if let Some(entry) = map.get_mut(&run_key) {
                    entry.usage.absorb(outcome.usage.input, outcome.usage.output);
                    entry.touch();
                }
            })
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to record isolated run usage");
        }

        let text = outcome.text.trim().to_string();
        if let Some(delivery) = &job.delivery
            && delivery.mode == DeliveryMode::Announce
            && !text.is_empty()
        {
            match self.resolve_route(delivery).await {
                Some((channel, to)) => {
                    let _ = self.delivery_tx.send(CronDelivery {
                        job_id: job.id.clone(),
                        channel,
                        to,
                        text: text.clone(),
                    });
                }
                None if delivery.best_effort => {
                    warn!(job_id = %job.id, "No delivery route, dropping announcement");
                }
                None => return Err("no delivery route resolvable".to_string()),
            }
        }
        Ok(Some(text))
    }

    /// `"last"` resolves to the most recently updated session with a
    /// delivery route; a concrete channel name is used as-is.
    async fn resolve_route(&self, delivery: &Delivery) -> Option<(String, Option<String>)> {
        if delivery.channel != "last" {
            return Some((delivery.channel.clone(), delivery.to.clone()));
        }
        let map = self.deps.sessions.load().await.ok()?;
        map.values()
            .filter(|entry| {
                entry
                    .last_delivery
                    .as_ref()
                    .is_some_and(|route| !route.is_empty())
            })
            .max_by_key(|entry| entry.updated_at)
            .and_then(|entry| entry.last_delivery.clone())
            .and_then(|route| route.channel.map(|channel| (channel, route.to)))
    }

    /// Delete `cron:*` session entries past retention. Throttled to run at
    /// most once per five minutes.
    async fn sweep_ephemeral(&self) {
        let Some(retention) = self.deps.config.ephemeral_retention else {
            return;
        };
        let now = now_ms();
        {
            let mut last = self.last_sweep_ms.lock().unwrap();
            if now - *last < SWEEP_EVERY_MS {
                return;
            }
            *last = now;
        }

        let retention_ms = retention.as_millis() as i64;
        let swept = self
            .deps
            .sessions
            .update(move |map| {
                let before = map.len();
                map.retain(|key, entry| {
                    !(key.is_cron() && now - entry.updated_at > retention_ms)
                });
                before - map.len()
            })
            .await;
        match swept {
            Ok(count) if count > 0 => info!(count, "Reaped ephemeral cron sessions"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ephemeral session sweep failed"),
        }
    }

    async fn persist(&self) -> Result<(), CronError> {
        let snapshot = self.jobs.lock().await.clone();
        self.store.save(&snapshot).await?;
        Ok(())
    }

    fn emit(&self, job_id: &str, action: CronAction, status: Option<RunStatus>, error: Option<String>) {
        let _ = self.events_tx.send(CronEvent {
            job_id: job_id.to_string(),
            action,
            status,
            error,
        });
    }
}

/// Next run for a repeating job that just completed: the natural schedule,
/// floored by the error backoff when the run failed.
fn reschedule_after(
    schedule: &Schedule,
    status: RunStatus,
    consecutive_errors: u32,
    ended: i64,
) -> Option<i64> {
    let natural = next_run_at(schedule, Some(ended), ended).unwrap_or(None);
    match status {
        RunStatus::Ok => natural,
        _ => {
            let floor = ended + backoff_ms(consecutive_errors);
            Some(natural.unwrap_or(floor).max(floor))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::error::ExecutorError;
    use crate::executor::{RunOutcome, StopReason};
    use crate::heartbeat::{HeartbeatOutcome, WakeHandler};
    use crate::session::{DeliveryRoute, SessionEntry, TokenUsage};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    struct ScriptedExecutor {
        replies: StdMutex<Vec<Result<String, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedExecutor {
        async fn run(&self, _request: RunRequest) -> Result<RunOutcome, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    Ok("done".to_string())
                } else {
                    replies.remove(0)
                }
            };
            match next {
                Ok(text) => Ok(RunOutcome {
                    text,
                    blocks: Vec::new(),
                    usage: TokenUsage {
                        input: 5,
                        output: 3,
                        total: 8,
                        compactions: 0,
                    },
                    stop_reason: StopReason::EndTurn,
                }),
                Err(reason) => Err(ExecutorError::Failed(reason)),
            }
        }

        async fn compact(&self, _: Uuid, _: u32) -> Result<(), ExecutorError> {
            Ok(())
        }
        fn is_busy(&self, _: Uuid) -> bool {
            false
        }
        fn enqueue_follow_up(&self, _: Uuid, _: &str) -> bool {
            false
        }
        async fn wait_for_idle(&self, _: Uuid, _: Duration) -> bool {
            true
        }
    }

    struct NoopHandler;
    #[async_trait]
    impl WakeHandler for NoopHandler {
        async fn on_wake(&self, _reason: &str) -> HeartbeatOutcome {
            HeartbeatOutcome::OkEmpty
        }
    }

    struct Fixture {
        scheduler: Arc<CronScheduler>,
        events: Arc<SystemEventQueue>,
        sessions: Arc<SessionStore>,
        executor: Arc<ScriptedExecutor>,
        store_path: PathBuf,
        _tmp: tempfile::TempDir,
    }

    fn fixture(replies: Vec<Result<&str, &str>>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            state_dir: tmp.path().to_path_buf(),
            ..CoreConfig::default()
        };
        let store_path = config.cron_jobs_path();
        let lanes = CommandLanes::new();
        let events = SystemEventQueue::new();
        let sessions = SessionStore::new(config.sessions_path());
        let wake = WakeCoordinator::new();
        wake.set_handler(Arc::new(NoopHandler));
        let executor = ScriptedExecutor::new(replies);

        let scheduler = CronScheduler::new(CronSchedulerDeps {
            config: CronConfig {
                default_timeout: Duration::from_millis(500),
                ephemeral_retention: Some(Duration::from_secs(3600)),
            },
            store_path: store_path.clone(),
            agent_id: "home".to_string(),
            lanes,
            events: events.clone(),
            wake,
            sessions: sessions.clone(),
            executor: executor.clone(),
        });
        Fixture {
            scheduler,
            events,
            sessions,
            executor,
            store_path,
            _tmp: tmp,
        }
    }

    fn every_job(id: &str, every_ms: i64) -> CronJob {
        CronJob {
            id: id.to_string(),
            name: format!("job {id}"),
            description: None,
            enabled: true,
            delete_after_run: false,
            schedule: Schedule::Every {
                every_ms,
                anchor_ms: None,
            },
            session_target: SessionTarget::Main,
            wake_mode: WakeMode::NextHeartbeat,
            payload: CronPayload::SystemEvent {
                text: "ping".to_string(),
            },
            delivery: None,
            state: Default::default(),
        }
    }

    fn isolated_job(id: &str) -> CronJob {
        CronJob {
            session_target: SessionTarget::Isolated,
            payload: CronPayload::AgentTurn {
                message: "summarize the day".to_string(),
                model: None,
                thinking: None,
                timeout_seconds: None,
            },
            ..every_job(id, 60_000)
        }
    }

    #[tokio::test]
    async fn one_shot_fires_on_time_and_is_deleted() {
        let fx = fixture(vec![]);
        let mut cron_events = fx.scheduler.subscribe();

        let at = Utc.timestamp_millis_opt(now_ms() + 80).single().unwrap();
        let job = CronJob {
            schedule: Schedule::At { at },
            delete_after_run: true,
            ..every_job("j1", 0)
        };
        fx.scheduler.add_job(job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;

        let mut saw_finished_ok = false;
        let mut saw_removed = false;
        while let Ok(event) = cron_events.try_recv() {
            if event.job_id == "j1" {
                if event.action == CronAction::Finished {
                    assert_eq!(event.status, Some(RunStatus::Ok));
                    saw_finished_ok = true;
                }
                if event.action == CronAction::Removed {
                    saw_removed = true;
                }
            }
        }
        assert!(saw_finished_ok);
        assert!(saw_removed);
        assert!(fx.scheduler.get_job("j1").await.is_none());

        // The system event landed in the main session's queue.
        assert_eq!(
            fx.events.peek(&SessionKey::main("home")).await,
            vec!["ping"]
        );
    }

    #[tokio::test]
    async fn missed_run_replays_exactly_once_on_startup() {
        let fx = fixture(vec![]);

        // Persist a job that was due five minutes ago.
        let mut job = every_job("j2", 60_000);
        job.state.next_run_at_ms = Some(now_ms() - 300_000);
        CronStore::new(&fx.store_path).save(&[job]).await.unwrap();

        fx.scheduler.start().await.unwrap();

        // Exactly one replay execution.
        assert_eq!(
            fx.events.peek(&SessionKey::main("home")).await,
            vec!["ping"]
        );
        let job = fx.scheduler.get_job("j2").await.unwrap();
        assert_eq!(job.state.last_status, Some(RunStatus::Ok));
        let next = job.state.next_run_at_ms.unwrap();
        let expected = now_ms() + 60_000;
        assert!((next - expected).abs() < 5_000, "next {next} vs {expected}");
    }

    #[tokio::test]
    async fn startup_clears_running_markers() {
        let fx = fixture(vec![]);

        let mut stuck = every_job("j3", 60_000);
        stuck.state.running_at_ms = Some(now_ms() - 3 * 3600 * 1000);
        stuck.state.next_run_at_ms = Some(now_ms() + 60_000);
        let mut interrupted = every_job("j4", 60_000);
        interrupted.state.running_at_ms = Some(now_ms() - 1000);
        interrupted.state.next_run_at_ms = Some(now_ms() + 60_000);
        CronStore::new(&fx.store_path)
            .save(&[stuck, interrupted])
            .await
            .unwrap();

        fx.scheduler.start().await.unwrap();
        for job in fx.scheduler.list_jobs().await {
            assert!(job.state.running_at_ms.is_none(), "job {}", job.id);
        }
    }

    #[tokio::test]
    async fn error_applies_backoff_and_success_resets_it() {
        let fx = fixture(vec![Err("model unavailable"), Ok("fine now")]);
        fx.scheduler.add_job(isolated_job("j5")).await.unwrap();

        let status = fx.scheduler.run_now("j5").await.unwrap();
        assert_eq!(status, RunStatus::Error);
        let job = fx.scheduler.get_job("j5").await.unwrap();
        assert_eq!(job.state.consecutive_errors, 1);
        assert_eq!(job.state.last_status, Some(RunStatus::Error));
        assert!(job.state.last_error.as_deref().unwrap().contains("model unavailable"));
        let ended = job.state.last_run_at_ms.unwrap();
        assert!(job.state.next_run_at_ms.unwrap() >= ended + 30_000);

        let status = fx.scheduler.run_now("j5").await.unwrap();
        assert_eq!(status, RunStatus::Ok);
        let job = fx.scheduler.get_job("j5").await.unwrap();
        assert_eq!(job.state.consecutive_errors, 0);
        assert!(job.state.running_at_ms.is_none());
    }

    #[tokio::test]
    async fn slow_job_times_out() {
        struct SlowExecutor;
        #[async_trait]
        impl AgentExecutor for SlowExecutor {
            async fn run(&self, _request: RunRequest) -> Result<RunOutcome, ExecutorError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                unreachable!("timeout fires first");
            }
            async fn compact(&self, _: Uuid, _: u32) -> Result<(), ExecutorError> {
                Ok(())
            }
            fn is_busy(&self, _: Uuid) -> bool {
                false
            }
            fn enqueue_follow_up(&self, _: Uuid, _: &str) -> bool {
                false
            }
            async fn wait_for_idle(&self, _: Uuid, _: Duration) -> bool {
                true
            }
        }

        let fx = fixture(vec![]);
        // Swap in a slow executor via a fresh scheduler sharing the fixture stores.
        let scheduler = CronScheduler::new(CronSchedulerDeps {
            config: CronConfig {
                default_timeout: Duration::from_millis(50),
                ephemeral_retention: None,
            },
            store_path: fx.store_path.clone(),
            agent_id: "home".to_string(),
            lanes: CommandLanes::new(),
            events: fx.events.clone(),
            wake: {
                let wake = WakeCoordinator::new();
                wake.set_handler(Arc::new(NoopHandler));
                wake
            },
            sessions: fx.sessions.clone(),
            executor: Arc::new(SlowExecutor),
        });
        scheduler.add_job(isolated_job("j6")).await.unwrap();

        let status = scheduler.run_now("j6").await.unwrap();
        assert_eq!(status, RunStatus::Error);
        let job = scheduler.get_job("j6").await.unwrap();
        assert!(job.state.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn isolated_announce_resolves_last_delivery_route() {
        let fx = fixture(vec![Ok("Today: two meetings, one deadline.")]);
        let mut deliveries = fx.scheduler.subscribe_deliveries();

        // A session with a delivery route the `last` channel resolves to.
        fx.sessions
            .update(|map| {
                let mut entry = SessionEntry::new();
                entry.last_delivery = Some(DeliveryRoute {
                    channel: Some("slack".to_string()),
                    to: Some("u1".to_string()),
                    ..DeliveryRoute::default()
                });
                map.insert(SessionKey::chat("home", "slack", "direct", "u1"), entry);
            })
            .await
            .unwrap();

        let mut job = isolated_job("j7");
        job.delivery = Some(Delivery {
            mode: DeliveryMode::Announce,
            channel: "last".to_string(),
            to: None,
            best_effort: false,
        });
        fx.scheduler.add_job(job).await.unwrap();

        let status = fx.scheduler.run_now("j7").await.unwrap();
        assert_eq!(status, RunStatus::Ok);

        let delivery = deliveries.try_recv().unwrap();
        assert_eq!(delivery.channel, "slack");
        assert_eq!(delivery.to.as_deref(), Some("u1"));
        assert!(delivery.text.contains("two meetings"));

        // The run left an ephemeral session behind.
        let map = fx.sessions.load().await.unwrap();
        assert!(map.keys().any(|k| k.as_str().starts_with("cron:j7:run:")));
    }

    #[tokio::test]
    async fn announce_without_route_fails_unless_best_effort() {
        let fx = fixture(vec![Ok("result"), Ok("result")]);

        let mut strict = isolated_job("j8");
        strict.delivery = Some(Delivery {
            mode: DeliveryMode::Announce,
            channel: "last".to_string(),
            to: None,
            best_effort: false,
        });
        fx.scheduler.add_job(strict).await.unwrap();
        assert_eq!(
            fx.scheduler.run_now("j8").await.unwrap(),
            RunStatus::Error
        );

        let mut lax = isolated_job("j9");
        lax.delivery = Some(Delivery {
            mode: DeliveryMode::Announce,
            channel: "last".to_string(),
            to: None,
            best_effort: true,
        });
        fx.scheduler.add_job(lax).await.unwrap();
        assert_eq!(fx.scheduler.run_now("j9").await.unwrap(), RunStatus::Ok);
    }

    #[tokio::test]
    async fn reaper_deletes_expired_ephemeral_sessions() {
        let fx = fixture(vec![]);

        fx.sessions
            .update(|map| {
                let mut stale = SessionEntry::new();
                stale.updated_at = now_ms() - 2 * 3600 * 1000; // past 1 h retention
                map.insert(SessionKey::new("cron:old:run:x"), stale);

                let mut fresh = SessionEntry::new();
                fresh.updated_at = now_ms();
                map.insert(SessionKey::new("cron:new:run:y"), fresh);

                map.insert(SessionKey::main("home"), SessionEntry::new());
            })
            .await
            .unwrap();

        fx.scheduler.add_job(every_job("j10", 60_000)).await.unwrap();
        fx.scheduler.run_now("j10").await.unwrap();

        let map = fx.sessions.load().await.unwrap();
        assert!(!map.contains_key(&SessionKey::new("cron:old:run:x")));
        assert!(map.contains_key(&SessionKey::new("cron:new:run:y")));
        assert!(map.contains_key(&SessionKey::main("home")));
    }

    #[tokio::test]
    async fn update_and_remove_emit_events() {
        let fx = fixture(vec![]);
        let mut cron_events = fx.scheduler.subscribe();

        fx.scheduler.add_job(every_job("j11", 60_000)).await.unwrap();
        fx.scheduler
            .update_job(
                "j11",
                JobPatch {
                    enabled: Some(false),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        fx.scheduler.remove_job("j11").await.unwrap();

        let actions: Vec<CronAction> = std::iter::from_fn(|| cron_events.try_recv().ok())
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![CronAction::Added, CronAction::Updated, CronAction::Removed]
        );

        assert!(matches!(
            fx.scheduler.remove_job("j11").await,
            Err(CronError::UnknownJob { .. })
        ));
        // Executor untouched by main-target bookkeeping.
        assert_eq!(fx.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sixth_error_of_a_fast_job_backs_off_a_full_hour() {
        let every_second = Schedule::Every {
            every_ms: 1000,
            anchor_ms: None,
        };
        let ended = 10_000_000;
        assert_eq!(
            reschedule_after(&every_second, RunStatus::Error, 6, ended),
            Some(ended + 3_600_000)
        );
        // A success snaps back to the natural cadence.
        assert_eq!(
            reschedule_after(&every_second, RunStatus::Ok, 0, ended),
            Some(ended + 1000)
        );
    }

    #[tokio::test]
    async fn disabled_job_update_clears_next_run() {
        let fx = fixture(vec![]);
        fx.scheduler.add_job(every_job("j12", 60_000)).await.unwrap();
        let job = fx
            .scheduler
            .update_job(
                "j12",
                JobPatch {
                    enabled: Some(false),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(job.state.next_run_at_ms.is_none());
    }
}
