use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension, params};
use tracing::{debug, info, warn};

use super::TaskStore;
use super::codec::{TASK_COLUMNS, decode_status, encode_ts, task_from_row};
use crate::core::error::{EngineError, Result};
use crate::core::task::{OutputFiles, Task, TaskStatus, resolve_transition};

/// Fields applied by [`TaskStore::update_status`]. Only the ones set are written.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub progress: Option<f64>,
    pub stage: Option<String>,
    pub error_message: Option<String>,
    pub output_files: Option<OutputFiles>,
    pub processing_time_seconds: Option<f64>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            stage: None,
            error_message: None,
            output_files: None,
            processing_time_seconds: None,
            estimated_completion: None,
        }
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn output_files(mut self, files: OutputFiles) -> Self {
        self.output_files = Some(files);
        self
    }

    pub fn duration_secs(mut self, seconds: f64) -> Self {
        self.processing_time_seconds = Some(seconds);
        self
    }

    pub fn estimated_completion(mut self, at: DateTime<Utc>) -> Self {
        self.estimated_completion = Some(at);
        self
    }
}

/// Listing filter; `limit: None` returns every matching row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Negative values are the failure sentinel and pass through.
fn validate_progress(progress: f64) -> Result<()> {
    if progress.is_nan() || progress > 100.0 {
        return Err(EngineError::InvalidProgress(progress));
    }
    Ok(())
}

impl TaskStore {
    pub fn create(&self, task: &Task) -> Result<()> {
        validate_progress(task.progress)?;
        let instruments = serde_json::to_string(&task.params.instruments)?;
        let output_files = task
            .output_files
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let db = self.lock();
        let inserted = db.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                task.task_id,
                task.status.as_str(),
                encode_ts(&task.created_at),
                task.started_at.as_ref().map(encode_ts),
                task.completed_at.as_ref().map(encode_ts),
                task.input.path.to_string_lossy(),
                task.input.size_bytes as i64,
                task.params.model_type,
                task.params.config_path,
                instruments,
                task.params.use_tta,
                task.params.extract_instrumental,
                task.params.output_format.as_str(),
                task.params.pcm_type.as_str(),
                task.progress,
                task.current_stage,
                task.estimated_completion.as_ref().map(encode_ts),
                output_files,
                task.error_message,
                task.processing_time_seconds,
            ],
        );

        match inserted {
            Ok(_) => {
                info!("Created task: {}", task.task_id);
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(EngineError::DuplicateTask(task.task_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let db = self.lock();
        let task = db
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Apply a status change plus whichever optional fields are set.
    ///
    /// `started_at` is written on the first move into `Processing` and
    /// `completed_at` on the first move into a terminal status. A transition
    /// the lifecycle forbids keeps the stored status; the remaining fields are
    /// still applied. Returns `false` for an unknown id.
    ///
    /// There is no per-row locking across calls: each task has exactly one
    /// writer (its worker) while it is active.
    pub fn update_status(&self, task_id: &str, update: StatusUpdate) -> Result<bool> {
        if let Some(progress) = update.progress {
            validate_progress(progress)?;
        }
        let output_files = update
            .output_files
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut db = self.lock();
        let tx = db.transaction()?;

        let current = tx
            .query_row(
                "SELECT status, started_at, completed_at FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| {
                    let status: String = row.get(0)?;
                    Ok((
                        decode_status(0, &status)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((current, started_at, completed_at)) = current else {
            warn!("Task {} not found for status update", task_id);
            return Ok(false);
        };

        let next = resolve_transition(current, update.status);
        if next != update.status {
            warn!(
                "Task {}: rejected transition {} -> {}, keeping {}",
                task_id, current, update.status, next
            );
        }

        let now = encode_ts(&Utc::now());
        let started_at = match started_at {
            None if next == TaskStatus::Processing => Some(now.clone()),
            other => other,
        };
        let completed_at = match completed_at {
            None if next.is_terminal() => Some(now),
            other => other,
        };

        tx.execute(
            "UPDATE tasks
             SET status = ?1,
                 started_at = ?2,
                 completed_at = ?3,
                 progress = COALESCE(?4, progress),
                 current_stage = COALESCE(?5, current_stage),
                 error_message = COALESCE(?6, error_message),
                 output_files = COALESCE(?7, output_files),
                 processing_time_seconds = COALESCE(?8, processing_time_seconds),
                 estimated_completion = COALESCE(?9, estimated_completion)
             WHERE task_id = ?10",
            params![
                next.as_str(),
                started_at,
                completed_at,
                update.progress,
                update.stage,
                update.error_message,
                output_files,
                update.processing_time_seconds,
                update.estimated_completion.as_ref().map(encode_ts),
                task_id,
            ],
        )?;
        tx.commit()?;

        if next != current {
            info!("Updated task {} status to {}", task_id, next);
        } else {
            debug!(
                "Updated task {} ({}): progress={:?} stage={:?}",
                task_id, next, update.progress, update.stage
            );
        }
        Ok(true)
    }

    /// Rows ordered newest first.
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let db = self.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![
                filter.status.map(TaskStatus::as_str),
                limit,
                filter.offset as i64
            ],
            task_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete(&self, task_id: &str) -> Result<bool> {
        let db = self.lock();
        let rows = db.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])?;
        if rows > 0 {
            info!("Deleted task: {}", task_id);
        } else {
            warn!("Task {} not found for deletion", task_id);
        }
        Ok(rows > 0)
    }

    pub fn count(&self, status: Option<TaskStatus>) -> Result<usize> {
        let db = self.lock();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM tasks WHERE (?1 IS NULL OR status = ?1)",
            params![status.map(TaskStatus::as_str)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// `Pending` and `Processing` rows, oldest first: work a previous process
    /// left unfinished.
    pub fn get_incomplete(&self) -> Result<Vec<Task>> {
        let db = self.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status IN ('pending', 'processing')
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], task_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        info!("Found {} incomplete tasks", out.len());
        Ok(out)
    }
}
