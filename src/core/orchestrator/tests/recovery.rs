use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::Mutex;

use super::{FakeSeparator, Harness, params};
use crate::config::EngineConfig;
use crate::core::error::EngineError;
use crate::core::lifecycle::LifecycleManager;
use crate::core::orchestrator::{OrchestratorComponent, RESTART_MESSAGE, RecoveryPolicy};
use crate::core::store::StatusUpdate;
use crate::core::task::{Task, TaskStatus};

const LONG: Duration = Duration::from_secs(10);

fn config(policy: RecoveryPolicy) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.recovery.policy = policy;
    config
}

/// Rows a crashed process would have left behind, oldest first.
fn leave_orphans(h: &Harness) {
    let base = Utc::now() - TimeDelta::minutes(30);

    let mut running = Task::new("was-running", h.input("was-running.wav"), 2048, params());
    running.created_at = base;
    h.store.create(&running).unwrap();
    h.store
        .update_status(
            "was-running",
            StatusUpdate::new(TaskStatus::Processing).progress(55.0),
        )
        .unwrap();

    let mut waiting = Task::new("was-waiting", h.input("was-waiting.wav"), 2048, params());
    waiting.created_at = base + TimeDelta::minutes(1);
    h.store.create(&waiting).unwrap();

    let mut done = Task::new("done", h.input("done.wav"), 2048, params());
    done.created_at = base - TimeDelta::minutes(1);
    h.store.create(&done).unwrap();
    h.store
        .update_status("done", StatusUpdate::new(TaskStatus::Completed))
        .unwrap();
}

#[test]
fn mark_failed_is_the_default_policy() {
    let h = Harness::with_config(EngineConfig::default(), 1, FakeSeparator::writing_stems());
    leave_orphans(&h);

    let report = h.orchestrator.recover_on_startup().unwrap();
    assert_eq!(report.found, ["was-running", "was-waiting"]);
    assert_eq!(report.marked_failed, ["was-running", "was-waiting"]);
    assert!(report.resubmitted.is_empty());

    for id in ["was-running", "was-waiting"] {
        let task = h.orchestrator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some(RESTART_MESSAGE));
        assert!(task.completed_at.is_some());
    }
    assert_eq!(
        h.orchestrator.get_task("done").unwrap().status,
        TaskStatus::Completed
    );

    // Nothing left on a second pass.
    assert!(h.orchestrator.recover_on_startup().unwrap().is_empty());
}

#[test]
fn resubmit_policy_runs_orphans_again() {
    let h = Harness::with_config(
        config(RecoveryPolicy::Resubmit),
        1,
        FakeSeparator::writing_stems(),
    );
    leave_orphans(&h);
    let first_start = h.store.get("was-running").unwrap().unwrap().started_at;

    let report = h.orchestrator.recover_on_startup().unwrap();
    assert_eq!(report.resubmitted, ["was-running", "was-waiting"]);
    assert!(h.orchestrator.shutdown(true, Some(LONG)));

    for id in ["was-running", "was-waiting"] {
        let task = h.orchestrator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "{id}");
        assert!(task.output_files.is_some());
    }
    // Write-once: the interrupted run's start time is kept.
    assert_eq!(
        h.orchestrator.get_task("was-running").unwrap().started_at,
        first_start
    );
}

#[test]
fn manual_policy_leaves_rows_for_operator() {
    let h = Harness::with_config(
        config(RecoveryPolicy::Manual),
        1,
        FakeSeparator::writing_stems(),
    );
    leave_orphans(&h);

    let report = h.orchestrator.recover_on_startup().unwrap();
    assert_eq!(report.left_for_operator, ["was-running", "was-waiting"]);
    assert_eq!(
        h.orchestrator.get_task("was-waiting").unwrap().status,
        TaskStatus::Pending
    );

    assert!(h.orchestrator.resubmit("was-waiting").unwrap());
    assert!(h.orchestrator.cancel_job("was-running"));
    assert!(h.orchestrator.shutdown(true, Some(LONG)));

    assert_eq!(
        h.orchestrator.get_task("was-waiting").unwrap().status,
        TaskStatus::Completed
    );
    let cancelled = h.orchestrator.get_task("was-running").unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.progress, 55.0);
}

#[test]
fn resubmit_rejects_unknown_and_finished_tasks() {
    let h = Harness::new(FakeSeparator::writing_stems());
    leave_orphans(&h);

    let err = h.orchestrator.resubmit("missing").unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == "missing"));
    assert!(!h.orchestrator.resubmit("done").unwrap());
}

#[test]
fn tasks_owned_by_this_process_are_not_recovered() {
    let (release, gate) = std::sync::mpsc::channel::<()>();
    let gate = std::sync::Mutex::new(gate);
    let h = Harness::with_config(
        EngineConfig::default(),
        1,
        FakeSeparator::new(move |request, _| {
            gate.lock().unwrap().recv().ok();
            super::write_stems(request)
        }),
    );
    let live = h.orchestrator.submit(h.request("live")).unwrap();

    let report = h.orchestrator.recover_on_startup().unwrap();
    assert!(report.is_empty());

    release.send(()).unwrap();
    assert!(live.wait_timeout(LONG).unwrap().is_success());
}

#[tokio::test]
async fn lifecycle_init_runs_recovery() {
    let h = Harness::new(FakeSeparator::writing_stems());
    leave_orphans(&h);

    let mut lifecycle = LifecycleManager::new().await.unwrap();
    lifecycle.attach(Arc::new(Mutex::new(OrchestratorComponent::new(Arc::clone(
        &h.orchestrator,
    )))));
    lifecycle.start().await.unwrap();

    assert_eq!(h.orchestrator.count_tasks(Some(TaskStatus::Failed)), 2);

    lifecycle.shutdown().await.unwrap();
    assert!(h.orchestrator.pool().is_shutdown());
}
