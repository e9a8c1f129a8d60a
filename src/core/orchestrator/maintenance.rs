use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_cron_scheduler::Job;
use tracing::{debug, error, info, warn};

use super::Orchestrator;
use crate::core::lifecycle::{LifecycleComponent, LifecycleManager};
use crate::core::store::RetentionPolicy;
use crate::core::task::Task;

impl Orchestrator {
    /// Delete expired terminal tasks. Returns how many rows went.
    ///
    /// Only terminal rows qualify, so this never races with a running task.
    pub fn sweep(&self) -> usize {
        let policy = RetentionPolicy::from_config(&self.config.cleanup);
        let purged = match self.store.purge_expired(&policy, Utc::now()) {
            Ok(purged) => purged,
            Err(e) => {
                error!("Retention sweep failed: {}", e);
                return 0;
            }
        };

        if self.config.cleanup.delete_artifacts {
            for task in &purged {
                self.remove_artifacts(task);
            }
        }
        if !purged.is_empty() {
            info!("Retention sweep removed {} tasks", purged.len());
        }
        purged.len()
    }

    fn remove_artifacts(&self, task: &Task) {
        if let Some(outputs) = &task.output_files {
            for path in outputs.values() {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("Removed {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Could not remove {}: {}", path.display(), e),
                }
            }
        }
        let dir = self.output_dir_for(&task.task_id);
        if dir.is_dir()
            && let Err(e) = std::fs::remove_dir_all(&dir)
        {
            warn!("Could not remove {}: {}", dir.display(), e);
        }
    }
}

/// Register the periodic retention sweep on the lifecycle scheduler.
pub async fn schedule_retention_sweep(
    lifecycle: &mut LifecycleManager,
    orchestrator: Arc<Orchestrator>,
) -> anyhow::Result<()> {
    let cleanup = &orchestrator.config().cleanup;
    if !cleanup.enabled {
        info!("Retention sweep disabled");
        return Ok(());
    }
    let schedule = cleanup.sweep_schedule.clone();

    let job = Job::new_async(schedule.as_str(), move |_uuid, mut _l| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || orchestrator.sweep()).await {
                Ok(removed) => debug!("Scheduled sweep finished ({} removed)", removed),
                Err(e) => error!("Scheduled sweep panicked: {}", e),
            }
        })
    })?;
    lifecycle.scheduler.add(job).await?;
    info!("Retention sweep scheduled: {}", schedule);
    Ok(())
}

/// Hooks the orchestrator into daemon startup and shutdown.
pub struct OrchestratorComponent {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorComponent {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for OrchestratorComponent {
    async fn on_init(&mut self) -> anyhow::Result<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let report = tokio::task::spawn_blocking(move || orchestrator.recover_on_startup()).await??;
        if !report.left_for_operator.is_empty() {
            warn!(
                "{} unfinished tasks need operator action: {:?}",
                report.left_for_operator.len(),
                report.left_for_operator
            );
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> anyhow::Result<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let timeout = Duration::from_secs(orchestrator.config().workers.shutdown_timeout_secs);
        let drained =
            tokio::task::spawn_blocking(move || orchestrator.shutdown(true, Some(timeout))).await?;
        if !drained {
            warn!(
                "Shutdown timeout of {}s elapsed with tasks still running",
                timeout.as_secs()
            );
        }
        Ok(())
    }
}
