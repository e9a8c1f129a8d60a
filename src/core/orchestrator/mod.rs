//! Ties the task store, the worker pool and the separator together.
//!
//! The orchestrator owns no state of its own beyond handles to those three:
//! the store is the source of truth for every task, the pool knows what is
//! queued or running right now.

mod job;
mod maintenance;
pub mod types;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::core::error::{EngineError, Result};
use crate::core::pool::{JobHandle, WorkerPool};
use crate::core::separator::{SeparationRequest, Separator};
use crate::core::store::{StatusUpdate, TaskFilter, TaskStore};
use crate::core::task::{Task, TaskStatus};

pub use maintenance::{OrchestratorComponent, schedule_retention_sweep};
pub use types::{JobRequest, RESTART_MESSAGE, RecoveryPolicy, RecoveryReport};

pub struct Orchestrator {
    config: Arc<EngineConfig>,
    store: Arc<TaskStore>,
    pool: Arc<WorkerPool>,
    separator: Arc<dyn Separator>,
    /// Held while a row and its pool entry can disagree: between creating a
    /// row and queueing it, and while cancelling an untracked row.
    admission: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<TaskStore>,
        pool: Arc<WorkerPool>,
        separator: Arc<dyn Separator>,
    ) -> Self {
        Self {
            config,
            store,
            pool,
            separator,
            admission: Mutex::new(()),
        }
    }

    fn admission(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Per-task output directory.
    pub fn output_dir_for(&self, task_id: &str) -> PathBuf {
        self.config.files.output_dir.join(task_id)
    }

    /// Persist a `Pending` task and queue it.
    pub fn submit_job(&self, request: JobRequest) -> Result<String> {
        self.submit(request).map(|handle| handle.id().to_string())
    }

    /// As [`Self::submit_job`], returning the pool handle for callers that
    /// want to wait on the run.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        if self.pool.is_shutdown() {
            return Err(EngineError::PoolShutdown);
        }
        let task_id = request
            .task_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let size_bytes = std::fs::metadata(&request.input_path)?.len();

        let task = Task::new(task_id, request.input_path, size_bytes, request.params);
        let _admission = self.admission();
        self.store.create(&task)?;
        info!(
            "Submitted task {} ({} on {})",
            task.task_id,
            task.params.model_type,
            task.input.path.display()
        );

        self.dispatch(&task).inspect_err(|e| {
            error!("Failed to queue task {}: {}", task.task_id, e);
            let update = StatusUpdate::new(TaskStatus::Failed)
                .stage("Failed")
                .error(format!("Could not queue task: {e}"));
            if let Err(e) = self.store.update_status(&task.task_id, update) {
                error!("Failed to record queueing failure for {}: {}", task.task_id, e);
            }
        })
    }

    /// Hand a stored task to the pool.
    fn dispatch(&self, task: &Task) -> Result<JobHandle> {
        let store = Arc::clone(&self.store);
        let separator = Arc::clone(&self.separator);
        let task_id = task.task_id.clone();
        let input_path = task.input.path.clone();
        let output_dir = self.output_dir_for(&task.task_id);
        let params = task.params.clone();

        self.pool.submit(task.task_id.clone(), move |device| {
            let request = SeparationRequest {
                task_id,
                input_path,
                output_dir,
                params,
                device: device.clone(),
            };
            job::run_task(&store, separator.as_ref(), request)
        })
    }

    /// Cancel a task that is not running in this process. Running tasks
    /// cannot be stopped.
    pub fn cancel_job(&self, task_id: &str) -> bool {
        let _admission = self.admission();
        if !self.pool.cancel(task_id) {
            if self.pool.is_tracked(task_id) {
                info!("Task {} is already running and cannot be cancelled", task_id);
                return false;
            }
            // An unfinished row no worker owns, e.g. left by a previous
            // process under the manual recovery policy.
            match self.store.get(task_id) {
                Ok(Some(task)) if !task.is_terminal() => {}
                Ok(_) => return false,
                Err(e) => {
                    error!("Failed to load task {} for cancellation: {}", task_id, e);
                    return false;
                }
            }
        }

        let update = StatusUpdate::new(TaskStatus::Cancelled).stage("Cancelled");
        match self.store.update_status(task_id, update) {
            Ok(updated) => {
                info!("Cancelled task {}", task_id);
                updated
            }
            Err(e) => {
                error!("Failed to record cancellation of {}: {}", task_id, e);
                false
            }
        }
    }

    /// Deal with tasks a previous process left `Pending` or `Processing`,
    /// according to the configured recovery policy.
    pub fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let policy = self.config.recovery.policy;
        let mut report = RecoveryReport::default();

        let _admission = self.admission();
        for task in self.store.get_incomplete()? {
            if self.pool.is_tracked(&task.task_id) {
                continue;
            }
            report.found.push(task.task_id.clone());

            match policy {
                RecoveryPolicy::MarkFailed => {
                    let update = StatusUpdate::new(TaskStatus::Failed)
                        .stage("Failed")
                        .error(RESTART_MESSAGE);
                    self.store.update_status(&task.task_id, update)?;
                    report.marked_failed.push(task.task_id);
                }
                RecoveryPolicy::Resubmit => match self.dispatch(&task) {
                    Ok(_) => report.resubmitted.push(task.task_id),
                    Err(e) => {
                        error!("Failed to resubmit task {}: {}", task.task_id, e);
                        let update = StatusUpdate::new(TaskStatus::Failed)
                            .stage("Failed")
                            .error(format!("{RESTART_MESSAGE}; resubmission failed: {e}"));
                        self.store.update_status(&task.task_id, update)?;
                        report.marked_failed.push(task.task_id);
                    }
                },
                RecoveryPolicy::Manual => {
                    warn!(
                        "Task {} ({}) left for operator action",
                        task.task_id, task.status
                    );
                    report.left_for_operator.push(task.task_id);
                }
            }
        }

        if report.is_empty() {
            info!("No unfinished tasks to recover");
        } else {
            info!(
                "Recovery ({}): {} found, {} failed, {} resubmitted, {} left",
                policy.as_str(),
                report.found.len(),
                report.marked_failed.len(),
                report.resubmitted.len(),
                report.left_for_operator.len()
            );
        }
        Ok(report)
    }

    /// Queue an unfinished task again from its stored parameters.
    ///
    /// Returns `false` when the task is already finished or already queued.
    pub fn resubmit(&self, task_id: &str) -> Result<bool> {
        let _admission = self.admission();
        let task = self
            .store
            .get(task_id)?
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;
        if task.is_terminal() || self.pool.is_tracked(task_id) {
            warn!("Refusing to resubmit task {} ({})", task_id, task.status);
            return Ok(false);
        }
        self.dispatch(&task)?;
        info!("Resubmitted task {}", task_id);
        Ok(true)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.store.get(task_id).unwrap_or_else(|e| {
            error!("Failed to load task {}: {}", task_id, e);
            None
        })
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.store.list(filter).unwrap_or_else(|e| {
            error!("Failed to list tasks: {}", e);
            Vec::new()
        })
    }

    pub fn count_tasks(&self, status: Option<TaskStatus>) -> usize {
        self.store.count(status).unwrap_or_else(|e| {
            error!("Failed to count tasks: {}", e);
            0
        })
    }

    /// Delete a task's row. Queued or running tasks are refused.
    pub fn delete_task(&self, task_id: &str) -> bool {
        if self.pool.is_tracked(task_id) {
            warn!("Refusing to delete task {} while it is queued or running", task_id);
            return false;
        }
        self.store.delete(task_id).unwrap_or_else(|e| {
            error!("Failed to delete task {}: {}", task_id, e);
            false
        })
    }

    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.pool.active_ids()
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.pool.is_active(task_id)
    }

    pub fn queued_count(&self) -> usize {
        self.pool.queued_count()
    }

    pub fn shutdown(&self, wait: bool, timeout: Option<Duration>) -> bool {
        self.pool.shutdown(wait, timeout)
    }
}

#[cfg(test)]
mod tests;
