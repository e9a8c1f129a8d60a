use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use super::{FakeSeparator, Harness};
use crate::config::EngineConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::orchestrator::schedule_retention_sweep;
use crate::core::pool::JobOutcome;
use crate::core::store::TaskStore;
use crate::core::task::{Task, TaskStatus};

const LONG: Duration = Duration::from_secs(10);

/// Rewrite a finished task's completion time to `age` ago.
fn backdate(store: &TaskStore, task: &Task, age: TimeDelta) {
    let mut old = task.clone();
    old.completed_at = Some(Utc::now() - age);
    store.delete(&task.task_id).unwrap();
    store.create(&old).unwrap();
}

fn run(h: &Harness, id: &str) -> Task {
    let handle = h.orchestrator.submit(h.request(id)).unwrap();
    assert_eq!(handle.wait_timeout(LONG), Some(JobOutcome::Succeeded));
    h.orchestrator.get_task(id).unwrap()
}

#[test]
fn sweep_removes_expired_tasks_and_their_outputs() {
    let h = Harness::new(FakeSeparator::writing_stems());
    let old = run(&h, "old");
    let fresh = run(&h, "fresh");
    backdate(&h.store, &old, TimeDelta::hours(25));

    let old_outputs: Vec<_> = old.output_files.clone().unwrap().into_values().collect();
    assert!(old_outputs.iter().all(|p| p.exists()));

    assert_eq!(h.orchestrator.sweep(), 1);
    assert!(h.orchestrator.get_task("old").is_none());
    assert!(old_outputs.iter().all(|p| !p.exists()));
    assert!(!h.orchestrator.output_dir_for("old").exists());

    let kept = h.orchestrator.get_task("fresh").unwrap();
    assert_eq!(kept.status, TaskStatus::Completed);
    assert!(
        fresh
            .output_files
            .unwrap()
            .values()
            .all(|p| p.exists())
    );
}

#[test]
fn sweep_can_keep_artifacts() {
    let mut config = EngineConfig::default();
    config.cleanup.delete_artifacts = false;
    let h = Harness::with_config(config, 1, FakeSeparator::writing_stems());
    let old = run(&h, "old");
    backdate(&h.store, &old, TimeDelta::days(8));

    assert_eq!(h.orchestrator.sweep(), 1);
    assert!(h.orchestrator.get_task("old").is_none());
    assert!(h.orchestrator.output_dir_for("old").is_dir());
}

#[test]
fn sweep_never_touches_unfinished_tasks() {
    let h = Harness::new(FakeSeparator::writing_stems());
    let mut ancient = Task::new("ancient", h.input("ancient.wav"), 2048, super::params());
    ancient.created_at = Utc::now() - TimeDelta::days(365);
    h.store.create(&ancient).unwrap();

    assert_eq!(h.orchestrator.sweep(), 0);
    assert!(h.orchestrator.get_task("ancient").is_some());
}

#[tokio::test]
async fn sweep_is_scheduled_only_when_enabled() {
    let mut disabled = EngineConfig::default();
    disabled.cleanup.enabled = false;
    let h = Harness::with_config(disabled, 1, FakeSeparator::writing_stems());
    let mut lifecycle = LifecycleManager::new().await.unwrap();
    schedule_retention_sweep(&mut lifecycle, Arc::clone(&h.orchestrator))
        .await
        .unwrap();

    let h = Harness::new(FakeSeparator::writing_stems());
    schedule_retention_sweep(&mut lifecycle, Arc::clone(&h.orchestrator))
        .await
        .unwrap();

    let mut broken = EngineConfig::default();
    broken.cleanup.sweep_schedule = "not a cron line at all".into();
    let h = Harness::with_config(broken, 1, FakeSeparator::writing_stems());
    assert!(
        schedule_retention_sweep(&mut lifecycle, Arc::clone(&h.orchestrator))
            .await
            .is_err()
    );
}

#[test]
fn sweep_with_huge_retention_keeps_everything() {
    let mut config = EngineConfig::default();
    config.cleanup.completed_retention_hours = u32::MAX;
    config.cleanup.failed_retention_hours = u32::MAX;
    config.cleanup.metadata_retention_days = u32::MAX;
    assert!(config.validate().is_ok());
    let h = Harness::with_config(config, 1, FakeSeparator::writing_stems());
    let done = run(&h, "done");
    backdate(&h.store, &done, TimeDelta::days(3650));

    assert_eq!(h.orchestrator.sweep(), 0);
    assert!(h.orchestrator.get_task("done").is_some());
}
