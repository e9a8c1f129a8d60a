//! What runs on a pool thread for one task.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use anyhow::anyhow;
use chrono::{TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::core::error::EngineError;
use crate::core::pool::panic_message;
use crate::core::progress::{MonotonicGate, ProgressEvent, ProgressListener};
use crate::core::separator::{SeparationRequest, Separator};
use crate::core::store::{StatusUpdate, TaskStore};
use crate::core::task::TaskStatus;

#[derive(Default)]
struct RunState {
    started: bool,
    gate: MonotonicGate,
    failure: Option<String>,
}

/// Forwards a run's progress callbacks into the task's row.
///
/// The first callback moves the task to `Processing`. A negative percentage
/// fails the task right away and is remembered so the run ends `Failed`
/// even if the routine returns normally afterwards.
pub(super) struct TaskProgress<'a> {
    store: &'a TaskStore,
    task_id: &'a str,
    started_at: Instant,
    state: Mutex<RunState>,
}

impl<'a> TaskProgress<'a> {
    pub(super) fn new(store: &'a TaskStore, task_id: &'a str) -> Self {
        Self {
            store,
            task_id,
            started_at: Instant::now(),
            state: Mutex::new(RunState::default()),
        }
    }

    fn write(&self, update: StatusUpdate) {
        match self.store.update_status(self.task_id, update) {
            Ok(true) => {}
            Ok(false) => warn!("Task {} vanished while running", self.task_id),
            Err(e) => error!("Failed to record progress for task {}: {}", self.task_id, e),
        }
    }

    /// Make sure `started_at` is set before the terminal write, even when the
    /// routine never reported progress.
    pub(super) fn ensure_started(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.started {
            state.started = true;
            drop(state);
            self.write(StatusUpdate::new(TaskStatus::Processing).stage("Processing"));
        }
    }

    pub(super) fn failure(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failure
            .clone()
    }

    fn estimate_completion(&self, percent: f64) -> Option<chrono::DateTime<Utc>> {
        if percent <= 0.0 || percent >= 100.0 {
            return None;
        }
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let remaining = elapsed * (100.0 - percent) / percent;
        let remaining = TimeDelta::try_milliseconds((remaining * 1000.0) as i64)?;
        // Tiny percentages extrapolate past the representable range.
        Utc::now().checked_add_signed(remaining)
    }
}

impl ProgressListener for TaskProgress<'_> {
    fn on_progress(&self, percent: f64, stage: &str) {
        match ProgressEvent::classify(percent, stage) {
            ProgressEvent::Ignored => {
                debug!("Task {}: ignoring NaN progress ({})", self.task_id, stage);
            }
            ProgressEvent::Failed { message } => {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.failure.is_some() {
                    return;
                }
                let was_started = std::mem::replace(&mut state.started, true);
                state.failure = Some(message.clone());
                drop(state);
                warn!("Task {} reported failure: {}", self.task_id, message);
                if !was_started {
                    self.write(StatusUpdate::new(TaskStatus::Processing));
                }
                self.write(
                    StatusUpdate::new(TaskStatus::Failed)
                        .progress(percent)
                        .stage(stage)
                        .error(message),
                );
            }
            ProgressEvent::Update { percent, stage } => {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.failure.is_some() {
                    return;
                }
                let Some(percent) = state.gate.admit(percent) else {
                    debug!(
                        "Task {}: dropping progress regression to {:.1}",
                        self.task_id, percent
                    );
                    return;
                };
                state.started = true;
                drop(state);

                let mut update = StatusUpdate::new(TaskStatus::Processing)
                    .progress(percent)
                    .stage(stage);
                if let Some(eta) = self.estimate_completion(percent) {
                    update = update.estimated_completion(eta);
                }
                self.write(update);
            }
        }
    }
}

/// Run one separation and record how it ended.
///
/// Returns an error when the task ended `Failed`, so the pool handle reports
/// the same outcome as the row. A row that is already terminal, e.g.
/// cancelled before a worker picked it up, is left untouched.
pub(super) fn run_task(
    store: &TaskStore,
    separator: &dyn Separator,
    request: SeparationRequest,
) -> anyhow::Result<()> {
    let task_id = request.task_id.clone();
    match store.get(&task_id)? {
        Some(task) if task.is_terminal() => {
            info!("Skipping task {}: already {}", task_id, task.status);
            return Err(EngineError::WorkerExecution {
                message: format!("task is already {}", task.status),
                task_id,
            }
            .into());
        }
        Some(_) => {}
        None => return Err(EngineError::NotFound(task_id).into()),
    }
    info!("Starting task {} on {}", task_id, request.device);

    let progress = TaskProgress::new(store, &task_id);
    let result = catch_unwind(AssertUnwindSafe(|| separator.separate(&request, &progress)))
        .unwrap_or_else(|panic| {
            Err(anyhow!(
                "separator panicked: {}",
                panic_message(panic.as_ref())
            ))
        });
    let duration = progress.started_at.elapsed().as_secs_f64();
    progress.ensure_started();

    let failure = match (result, progress.failure()) {
        (_, Some(message)) => message,
        (Ok(outputs), None) => {
            let update = StatusUpdate::new(TaskStatus::Completed)
                .stage("Completed")
                .output_files(outputs)
                .duration_secs(duration);
            store.update_status(&task_id, update)?;
            info!("Task {} completed in {:.1}s", task_id, duration);
            return Ok(());
        }
        (Err(e), None) => format!("{e:#}"),
    };

    let update = StatusUpdate::new(TaskStatus::Failed)
        .stage("Failed")
        .error(failure.clone())
        .duration_secs(duration);
    store.update_status(&task_id, update)?;
    Err(EngineError::WorkerExecution {
        task_id,
        message: failure,
    }
    .into())
}
