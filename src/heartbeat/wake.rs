//! Coalesced heartbeat wake handling.
//!
//! Many sources ask for a heartbeat (gateway methods, cron fires, exec
//! completions, the interval scheduler). Requests within the coalesce
//! window collapse into one handler invocation; the first recorded reason
//! wins. While the handler runs, further requests accumulate and re-arm the
//! timer when it finishes.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Default coalesce window.
pub const DEFAULT_COALESCE: Duration = Duration::from_millis(250);
/// Backoff before retrying after a failure or a busy skip.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Why a heartbeat did not produce output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    AgentDisabled,
    InvalidInterval,
    OutsideActiveHours,
    RequestsInFlight,
    NotDue,
    NothingToDo,
    NoDeliveryTarget,
    HiddenByVisibility,
    DuplicateContent,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::AgentDisabled => "agent-disabled",
            SkipReason::InvalidInterval => "invalid-interval",
            SkipReason::OutsideActiveHours => "outside-active-hours",
            SkipReason::RequestsInFlight => "requests-in-flight",
            SkipReason::NotDue => "not-due",
            SkipReason::NothingToDo => "nothing-to-do",
            SkipReason::NoDeliveryTarget => "no-delivery-target",
            SkipReason::HiddenByVisibility => "hidden-by-visibility",
            SkipReason::DuplicateContent => "duplicate-content",
        }
    }
}

/// Indicator tag accompanying every heartbeat outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Ok,
    Alert,
    Error,
    None,
}

impl Indicator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Indicator::Ok => "ok",
            Indicator::Alert => "alert",
            Indicator::Error => "error",
            Indicator::None => "none",
        }
    }
}

/// Result of one heartbeat handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatOutcome {
    /// Content was produced and routed to the delivery target.
    Sent,
    /// The agent returned nothing.
    OkEmpty,
    /// The agent acknowledged with the OK token.
    OkToken { ack: String },
    Skipped(SkipReason),
    Failed(String),
}

impl HeartbeatOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            HeartbeatOutcome::Sent => "sent",
            HeartbeatOutcome::OkEmpty => "ok-empty",
            HeartbeatOutcome::OkToken { .. } => "ok-token",
            HeartbeatOutcome::Skipped(_) => "skipped",
            HeartbeatOutcome::Failed(_) => "failed",
        }
    }

    pub fn indicator(&self) -> Indicator {
        match self {
            HeartbeatOutcome::Sent => Indicator::Alert,
            HeartbeatOutcome::OkEmpty | HeartbeatOutcome::OkToken { .. } => Indicator::Ok,
            HeartbeatOutcome::Skipped(_) => Indicator::None,
            HeartbeatOutcome::Failed(_) => Indicator::Error,
        }
    }
}

/// The single consumer of wake requests.
#[async_trait]
pub trait WakeHandler: Send + Sync {
    async fn on_wake(&self, reason: &str) -> HeartbeatOutcome;
}

#[derive(Default)]
struct WakeInner {
    pending_reason: Option<String>,
    running: bool,
    /// Generation counter; only the newest armed timer may fire.
    timer_gen: u64,
}

/// Coalesces wake requests into single handler invocations.
pub struct WakeCoordinator {
    inner: Mutex<WakeInner>,
    handler: OnceLock<Arc<dyn WakeHandler>>,
}

impl WakeCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(WakeInner::default()),
            handler: OnceLock::new(),
        })
    }

    /// Attach the handler. May be called once; later calls are ignored.
    pub fn set_handler(&self, handler: Arc<dyn WakeHandler>) {
        let _ = self.handler.set(handler);
    }

    /// Request a heartbeat with the default coalesce window.
    pub fn request(self: &Arc<Self>, reason: &str) {
        self.request_within(reason, DEFAULT_COALESCE);
    }

    /// Request a heartbeat; the handler runs after `coalesce` unless it is
    /// already running, in which case the request is absorbed and the timer
    /// re-armed on completion. The first pending reason is kept.
    pub fn request_within(self: &Arc<Self>, reason: &str, coalesce: Duration) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending_reason.is_none() {
                inner.pending_reason = Some(reason.to_string());
            }
            inner.timer_gen += 1;
            inner.timer_gen
        };
        self.arm(generation, coalesce);
    }

    fn arm(self: &Arc<Self>, generation: u64, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(generation).await;
        });
    }

    async fn fire(self: Arc<Self>, generation: u64) {
        let reason = {
            let mut inner = self.inner.lock().unwrap();
            if inner.timer_gen != generation {
                return; // superseded by a newer arm
            }
            if inner.running {
                inner.timer_gen += 1;
                let next = inner.timer_gen;
                drop(inner);
                self.arm(next, DEFAULT_COALESCE);
                return;
            }
            let Some(reason) = inner.pending_reason.take() else {
                return;
            };
            inner.running = true;
            reason
        };

        let outcome = match self.handler.get() {
            Some(handler) => handler.on_wake(&reason).await,
            None => {
                warn!("Heartbeat wake fired with no handler attached");
                HeartbeatOutcome::Failed("no wake handler".to_string())
            }
        };
        debug!(reason = %reason, status = outcome.status(), "Heartbeat wake completed");

        let rearm = {
            let mut inner = self.inner.lock().unwrap();
            inner.running = false;

            let delay = if inner.pending_reason.is_some() {
                // A reason accumulated while we ran.
                Some(DEFAULT_COALESCE)
            } else {
                match &outcome {
                    HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight) => {
                        inner.pending_reason = Some(reason);
                        Some(RETRY_BACKOFF)
                    }
                    HeartbeatOutcome::Failed(_) => {
                        inner.pending_reason = Some("retry".to_string());
                        Some(RETRY_BACKOFF)
                    }
                    _ => None,
                }
            };
            delay.map(|delay| {
                inner.timer_gen += 1;
                (inner.timer_gen, delay)
            })
        };

        if let Some((generation, delay)) = rearm {
            self.arm(generation, delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHandler {
        reasons: Mutex<Vec<String>>,
        outcomes: Mutex<Vec<HeartbeatOutcome>>,
        calls: AtomicUsize,
    }

    impl RecordingHandler {
        fn new(outcomes: Vec<HeartbeatOutcome>) -> Arc<Self> {
            Arc::new(Self {
                reasons: Mutex::new(Vec::new()),
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WakeHandler for RecordingHandler {
        async fn on_wake(&self, reason: &str) -> HeartbeatOutcome {
            self.reasons.lock().unwrap().push(reason.to_string());
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                HeartbeatOutcome::OkEmpty
            } else {
                outcomes.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn three_requests_coalesce_into_one_with_first_reason() {
        let wake = WakeCoordinator::new();
        let handler = RecordingHandler::new(vec![]);
        wake.set_handler(handler.clone());

        wake.request_within("a", Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(20)).await;
        wake.request_within("b", Duration::from_millis(100));
        wake.request_within("c", Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.reasons.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn zero_coalesce_fires_promptly() {
        let wake = WakeCoordinator::new();
        let handler = RecordingHandler::new(vec![]);
        wake.set_handler(handler.clone());

        wake.request_within("interval", Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_skip_retries_after_backoff() {
        let wake = WakeCoordinator::new();
        let handler = RecordingHandler::new(vec![HeartbeatOutcome::Skipped(
            SkipReason::RequestsInFlight,
        )]);
        wake.set_handler(handler.clone());

        wake.request_within("cron:j1", Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(1300)).await;

        // First call was busy-skipped; the retry keeps the original reason.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *handler.reasons.lock().unwrap(),
            vec!["cron:j1", "cron:j1"]
        );
    }

    #[tokio::test]
    async fn failure_retries_with_retry_reason() {
        let wake = WakeCoordinator::new();
        let handler =
            RecordingHandler::new(vec![HeartbeatOutcome::Failed("boom".to_string())]);
        wake.set_handler(handler.clone());

        wake.request_within("a", Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(1300)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*handler.reasons.lock().unwrap(), vec!["a", "retry"]);
    }

    #[tokio::test]
    async fn request_during_run_triggers_follow_up() {
        struct SlowHandler {
            calls: AtomicUsize,
            reasons: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl WakeHandler for SlowHandler {
            async fn on_wake(&self, reason: &str) -> HeartbeatOutcome {
                self.reasons.lock().unwrap().push(reason.to_string());
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(150)).await;
                HeartbeatOutcome::OkEmpty
            }
        }

        let wake = WakeCoordinator::new();
        let handler = Arc::new(SlowHandler {
            calls: AtomicUsize::new(0),
            reasons: Mutex::new(Vec::new()),
        });
        wake.set_handler(handler.clone());

        wake.request_within("first", Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Arrives mid-run; must be absorbed and handled afterwards.
        wake.request_within("second", Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *handler.reasons.lock().unwrap(),
            vec!["first", "second"]
        );
    }

    #[test]
    fn outcome_statuses_and_indicators() {
        assert_eq!(HeartbeatOutcome::Sent.status(), "sent");
        assert_eq!(HeartbeatOutcome::Sent.indicator(), Indicator::Alert);
        assert_eq!(HeartbeatOutcome::OkEmpty.status(), "ok-empty");
        assert_eq!(
            HeartbeatOutcome::OkToken { ack: String::new() }.status(),
            "ok-token"
        );
        assert_eq!(
            HeartbeatOutcome::Skipped(SkipReason::NothingToDo).indicator(),
            Indicator::None
        );
        assert_eq!(
            HeartbeatOutcome::Failed(String::new()).indicator(),
            Indicator::Error
        );
    }
}
