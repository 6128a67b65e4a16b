//! Durable cron scheduling.
//!
//! `types` holds the persisted job model, `schedule` the next-run and
//! backoff math, `store` the jobs.json persistence, and `scheduler` the
//! timer engine with crash recovery and missed-run replay.

pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod types;

pub use scheduler::{CronAction, CronDelivery, CronEvent, CronScheduler, CronSchedulerDeps, JobPatch};
pub use store::CronStore;
pub use types::{
    CronJob, CronPayload, Delivery, DeliveryMode, JobState, RunStatus, Schedule, SessionTarget,
    WakeMode,
};
