//! Command-lane dispatcher.
//!
//! An in-process scheduler keyed by lane name. Tasks on one lane run FIFO
//! with a per-lane concurrency cap (strict happens-before at the default cap
//! of one); tasks on different lanes run in parallel. Lanes named
//! `session:{sessionKey}` serialize work per session.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::LaneError;
use crate::session::SessionKey;

/// Built-in lane names.
pub mod lane {
    pub const MAIN: &str = "main";
    pub const CRON: &str = "cron";
    pub const SUBAGENT: &str = "subagent";
    pub const NESTED: &str = "nested";
}

/// The conventional lane for per-session serialization.
pub fn session_lane(key: &SessionKey) -> String {
    format!("session:{key}")
}

fn default_limit(lane: &str) -> usize {
    match lane {
        lane::SUBAGENT => 2,
        _ => 1,
    }
}

/// Callback invoked when a task has waited longer than its warn threshold.
pub type WaitCallback = Arc<dyn Fn(Duration, usize) + Send + Sync>;

/// Options for [`CommandLanes::enqueue_with`].
#[derive(Default, Clone)]
pub struct EnqueueOpts {
    pub warn_after: Option<Duration>,
    pub on_wait: Option<WaitCallback>,
}

struct QueuedTask {
    run: BoxFuture<'static, ()>,
    started_tx: Option<oneshot::Sender<()>>,
}

struct LaneState {
    queue: VecDeque<QueuedTask>,
    active: usize,
    max_concurrent: usize,
    draining: bool,
}

impl LaneState {
    fn new(lane: &str) -> Self {
        Self {
            queue: VecDeque::new(),
            active: 0,
            max_concurrent: default_limit(lane),
            draining: false,
        }
    }
}

/// Future handle for an enqueued task's result.
pub struct LaneTicket<T> {
    lane: String,
    rx: oneshot::Receiver<Result<T, LaneError>>,
}

impl<T> LaneTicket<T> {
    /// Wait for the task to resolve. A task dropped by [`CommandLanes::clear`]
    /// resolves to `LaneError::Cancelled`.
    pub async fn join(self) -> Result<T, LaneError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(LaneError::Cancelled { lane: self.lane }),
        }
    }
}

/// The dispatcher. Cheap to share; all state lives behind one mutex.
pub struct CommandLanes {
    lanes: Mutex<HashMap<String, LaneState>>,
}

impl CommandLanes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lanes: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue a task on a lane and receive a ticket for its result.
    ///
    /// Tasks on the same lane observe happens-before: at the default cap of
    /// one, task *n+1* starts only after task *n* resolved or failed. A
    /// panicking task is caught and reported through its ticket only; the
    /// lane keeps draining.
    pub fn enqueue<T, F>(self: &Arc<Self>, lane: &str, fut: F) -> LaneTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.enqueue_with(lane, fut, EnqueueOpts::default())
    }

    pub fn enqueue_with<T, F>(self: &Arc<Self>, lane: &str, fut: F, opts: EnqueueOpts) -> LaneTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, LaneError>>();
        let lane_name = lane.to_string();

        let run: BoxFuture<'static, ()> = Box::pin(async move {
            // Spawn so a panic is contained to the task and surfaced as a
            // JoinError instead of wedging the lane.
            let joined = tokio::spawn(fut).await;
            let result = joined.map_err(|e| {
                warn!(lane = %lane_name, error = %e, "Lane task panicked");
                LaneError::Panicked {
                    lane: lane_name.clone(),
                    reason: e.to_string(),
                }
            });
            let _ = tx.send(result);
        });

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let queued_ahead;
        {
            let mut lanes = self.lanes.lock().unwrap();
            let state = lanes
                .entry(lane.to_string())
                .or_insert_with(|| LaneState::new(lane));
            queued_ahead = state.queue.len() + state.active;
            state.queue.push_back(QueuedTask {
                run,
                started_tx: Some(started_tx),
            });
        }

        if let Some(warn_after) = opts.warn_after {
            let on_wait = opts.on_wait.clone();
            let lane_owned = lane.to_string();
            let enqueued_at = Instant::now();
            tokio::spawn(async move {
                let mut started_rx = started_rx;
                tokio::select! {
                    _ = tokio::time::sleep(warn_after) => {
                        let waited = enqueued_at.elapsed();
                        debug!(lane = %lane_owned, waited_ms = waited.as_millis() as u64,
                               queued_ahead, "Task waiting in lane");
                        if let Some(cb) = on_wait {
                            cb(waited, queued_ahead);
                        }
                    }
                    _ = &mut started_rx => {}
                }
            });
        }

        self.pump(lane);
        LaneTicket {
            lane: lane.to_string(),
            rx,
        }
    }

    /// Drop pending tasks on a lane (in-flight tasks keep running).
    /// Returns the number of tasks dropped.
    pub fn clear(&self, lane: &str) -> usize {
        let mut lanes = self.lanes.lock().unwrap();
        match lanes.get_mut(lane) {
            Some(state) => {
                let dropped = state.queue.len();
                state.queue.clear();
                dropped
            }
            None => 0,
        }
    }

    /// Outstanding depth (queued plus executing) of one lane, or of all
    /// lanes when `lane` is `None`.
    pub fn queue_size(&self, lane: Option<&str>) -> usize {
        let lanes = self.lanes.lock().unwrap();
        match lane {
            Some(name) => lanes
                .get(name)
                .map(|s| s.queue.len() + s.active)
                .unwrap_or(0),
            None => lanes.values().map(|s| s.queue.len() + s.active).sum(),
        }
    }

    /// Override a lane's concurrency cap.
    pub fn set_limit(self: &Arc<Self>, lane: &str, max_concurrent: usize) {
        {
            let mut lanes = self.lanes.lock().unwrap();
            let state = lanes
                .entry(lane.to_string())
                .or_insert_with(|| LaneState::new(lane));
            state.max_concurrent = max_concurrent.max(1);
        }
        self.pump(lane);
    }

    /// Wait until a lane has no queued or executing tasks.
    /// Returns `false` on timeout.
    pub async fn wait_idle(&self, lane: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue_size(Some(lane)) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Drain loop: start queued tasks while the lane has capacity. The
    /// `draining` flag keeps re-entrant pumps from overlapping.
    fn pump(self: &Arc<Self>, lane: &str) {
        let mut lanes = self.lanes.lock().unwrap();
        let Some(state) = lanes.get_mut(lane) else {
            return;
        };
        if state.draining {
            return;
        }
        state.draining = true;

        while state.active < state.max_concurrent {
            let Some(mut task) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            if let Some(started) = task.started_tx.take() {
                let _ = started.send(());
            }

            let this = Arc::clone(self);
            let lane_owned = lane.to_string();
            tokio::spawn(async move {
                task.run.await;
                this.task_done(&lane_owned);
            });
        }

        state.draining = false;
    }

    fn task_done(self: &Arc<Self>, lane: &str) {
        {
            let mut lanes = self.lanes.lock().unwrap();
            if let Some(state) = lanes.get_mut(lane) {
                state.active = state.active.saturating_sub(1);
            }
        }
        self.pump(lane);
    }
}
