//! Runtime assembly.
//!
//! All the module-level singletons of the source system become explicit
//! objects built once here and passed by reference; tests construct
//! isolated instances the same way.

use std::sync::Arc;

use crate::config::CoreConfig;
use crate::cron::{CronScheduler, CronSchedulerDeps};
use crate::error::CronError;
use crate::events::SystemEventQueue;
use crate::executor::AgentExecutor;
use crate::gateway::approvals::ApprovalQueue;
use crate::gateway::auth::DeviceKeyRegistry;
use crate::gateway::nodes::NodeRegistry;
use crate::heartbeat::runner::{HeartbeatDeps, HeartbeatRunner};
use crate::heartbeat::{Heartbeats, WakeCoordinator};
use crate::lanes::CommandLanes;
use crate::session::SessionStore;

/// The assembled core: one of everything, shared by reference.
pub struct CoreRuntime {
    pub config: CoreConfig,
    pub sessions: Arc<SessionStore>,
    pub lanes: Arc<CommandLanes>,
    pub events: Arc<SystemEventQueue>,
    pub heartbeats: Arc<Heartbeats>,
    pub wake: Arc<WakeCoordinator>,
    pub runner: Arc<HeartbeatRunner>,
    pub cron: Arc<CronScheduler>,
    pub nodes: Arc<NodeRegistry>,
    pub approvals: Arc<ApprovalQueue>,
    pub devices: Arc<DeviceKeyRegistry>,
    pub executor: Arc<dyn AgentExecutor>,
}

impl CoreRuntime {
    /// Wire every subsystem together. Nothing is scheduled until
    /// [`CoreRuntime::start`].
    pub fn build(config: CoreConfig, executor: Arc<dyn AgentExecutor>) -> Arc<Self> {
        let sessions = SessionStore::new(config.sessions_path());
        let lanes = CommandLanes::new();
        let events = SystemEventQueue::new();
        let heartbeats = Heartbeats::new();
        let wake = WakeCoordinator::new();

        let runner = HeartbeatRunner::new(HeartbeatDeps {
            config: config.clone(),
            registry: heartbeats.clone(),
            lanes: lanes.clone(),
            events: events.clone(),
            sessions: sessions.clone(),
            executor: executor.clone(),
        });
        wake.set_handler(runner.clone());

        let cron = CronScheduler::new(CronSchedulerDeps {
            config: config.cron.clone(),
            store_path: config.cron_jobs_path(),
            agent_id: config.agent_id.clone(),
            lanes: lanes.clone(),
            events: events.clone(),
            wake: wake.clone(),
            sessions: sessions.clone(),
            executor: executor.clone(),
        });

        Arc::new(Self {
            config,
            sessions,
            lanes,
            events,
            heartbeats,
            wake,
            runner,
            cron,
            nodes: Arc::new(NodeRegistry::new()),
            approvals: Arc::new(ApprovalQueue::new()),
            devices: Arc::new(DeviceKeyRegistry::new()),
            executor,
        })
    }

    /// Recover and arm the schedulers: cron startup (crash recovery, missed
    /// replay, timer) and the default agent's heartbeat interval.
    pub async fn start(self: &Arc<Self>) -> Result<(), CronError> {
        self.cron.start().await?;
        self.heartbeats
            .register(&self.config.agent_id, Default::default());
        self.heartbeats.attach_wake(self.wake.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::UnconfiguredExecutor;

    #[tokio::test]
    async fn build_and_start_an_isolated_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            state_dir: tmp.path().to_path_buf(),
            ..CoreConfig::default()
        };
        let runtime = CoreRuntime::build(config, Arc::new(UnconfiguredExecutor));
        runtime.start().await.unwrap();

        assert!(runtime.cron.list_jobs().await.is_empty());
        assert_eq!(runtime.heartbeats.agent_ids(), vec!["main".to_string()]);
    }
}
