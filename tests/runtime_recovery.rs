//! End-to-end recovery and persistence tests against a full runtime.

use std::sync::Arc;

use openclaw_core::config::CoreConfig;
use openclaw_core::cron::{
    CronJob, CronPayload, CronStore, JobState, Schedule, SessionTarget, WakeMode,
};
use openclaw_core::executor::UnconfiguredExecutor;
use openclaw_core::runtime::CoreRuntime;
use openclaw_core::session::{SessionEntry, SessionKey};
use openclaw_core::util::time::now_ms;

fn test_config(tmp: &tempfile::TempDir) -> CoreConfig {
    CoreConfig {
        state_dir: tmp.path().to_path_buf(),
        ..CoreConfig::default()
    }
}

fn reminder_job(id: &str, every_ms: i64, state: JobState) -> CronJob {
    CronJob {
        id: id.to_string(),
        name: format!("reminder {id}"),
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
            text: "stand up".to_string(),
        },
        delivery: None,
        state,
    }
}

#[tokio::test]
async fn overdue_jobs_replay_once_and_reschedule() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);

    // A job that was due five minutes before "startup".
    let state = JobState {
        next_run_at_ms: Some(now_ms() - 300_000),
        ..JobState::default()
    };
    CronStore::new(config.cron_jobs_path())
        .save(&[reminder_job("j2", 60_000, state)])
        .await
        .unwrap();

    let runtime = CoreRuntime::build(config, Arc::new(UnconfiguredExecutor));
    runtime.start().await.unwrap();

    // The missed window collapsed into exactly one system event.
    let main_key = SessionKey::main(&runtime.config.agent_id);
    assert_eq!(runtime.events.peek(&main_key).await, vec!["stand up"]);

    let job = runtime.cron.get_job("j2").await.unwrap();
    assert!(job.state.running_at_ms.is_none());
    let next = job.state.next_run_at_ms.unwrap();
    let expected = now_ms() + 60_000;
    assert!((next - expected).abs() < 5_000, "next {next} vs {expected}");
}

#[tokio::test]
async fn startup_recovery_clears_all_running_markers() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);

    let stuck = JobState {
        running_at_ms: Some(now_ms() - 3 * 3600 * 1000),
        next_run_at_ms: Some(now_ms() + 3600_000),
        ..JobState::default()
    };
    let interrupted = JobState {
        running_at_ms: Some(now_ms() - 5_000),
        next_run_at_ms: Some(now_ms() + 3600_000),
        ..JobState::default()
    };
    CronStore::new(config.cron_jobs_path())
        .save(&[
            reminder_job("stuck", 3_600_000, stuck),
            reminder_job("interrupted", 3_600_000, interrupted),
        ])
        .await
        .unwrap();

    let runtime = CoreRuntime::build(config.clone(), Arc::new(UnconfiguredExecutor));
    runtime.start().await.unwrap();

    for job in runtime.cron.list_jobs().await {
        assert!(job.state.running_at_ms.is_none(), "job {}", job.id);
    }

    // The cleared markers were persisted, not just held in memory.
    let reloaded = CronStore::new(config.cron_jobs_path()).load().await.unwrap();
    for job in reloaded {
        assert!(job.state.running_at_ms.is_none(), "persisted job {}", job.id);
    }
}

#[tokio::test]
async fn concurrent_session_updates_do_not_lose_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = CoreRuntime::build(test_config(&tmp), Arc::new(UnconfiguredExecutor));
    let key = SessionKey::main("home");

    runtime
        .sessions
        .update({
            let key = key.clone();
            move |map| {
                map.insert(key, SessionEntry::new());
            }
        })
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let sessions = runtime.sessions.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                sessions
                    .update({
                        let key = key.clone();
                        move |map| {
                            let entry = map.get_mut(&key).unwrap();
                            entry.usage.absorb(1, 0);
                        }
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Every one of the 40 increments survived the contention.
    let map = runtime.sessions.load().await.unwrap();
    assert_eq!(map.get(&key).unwrap().usage.input, 40);
    assert_eq!(map.get(&key).unwrap().usage.total, 40);
}

#[tokio::test]
async fn session_store_survives_process_handoff() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(&tmp);

    {
        let runtime = CoreRuntime::build(config.clone(), Arc::new(UnconfiguredExecutor));
        runtime
            .sessions
            .update(|map| {
                let mut entry = SessionEntry::new();
                entry.subject = Some("carry me over".to_string());
                map.insert(SessionKey::main("home"), entry);
            })
            .await
            .unwrap();
    }

    // A fresh runtime over the same state dir sees the same data.
    let runtime = CoreRuntime::build(config, Arc::new(UnconfiguredExecutor));
    let map = runtime.sessions.load().await.unwrap();
    assert_eq!(
        map.get(&SessionKey::main("home")).unwrap().subject.as_deref(),
        Some("carry me over")
    );
}
