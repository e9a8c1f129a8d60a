use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::params;
use tracing::{debug, info};

use super::TaskStore;
use super::codec::{TASK_COLUMNS, encode_ts, task_from_row};
use crate::config::CleanupConfig;
use crate::core::error::Result;
use crate::core::task::{Task, TaskStatus};

/// Age limits for terminal rows.
///
/// `metadata` caps every terminal status; `completed` and `failed` narrow it
/// per status. `Cancelled` rows share the `failed` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: TimeDelta,
    pub failed: TimeDelta,
    pub metadata: TimeDelta,
}

impl RetentionPolicy {
    pub fn new(completed_hours: i64, failed_hours: i64, metadata_days: i64) -> Self {
        Self {
            completed: TimeDelta::hours(completed_hours),
            failed: TimeDelta::hours(failed_hours),
            metadata: TimeDelta::days(metadata_days),
        }
    }

    pub fn from_config(config: &CleanupConfig) -> Self {
        Self::new(
            i64::from(config.completed_retention_hours),
            i64::from(config.failed_retention_hours),
            i64::from(config.metadata_retention_days),
        )
    }

    /// Effective window for a status, `None` for statuses that never expire.
    pub fn window(&self, status: TaskStatus) -> Option<TimeDelta> {
        let per_status = match status {
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed | TaskStatus::Cancelled => self.failed,
            TaskStatus::Pending | TaskStatus::Processing => return None,
        };
        Some(per_status.min(self.metadata))
    }

    /// Rows of `status` completed strictly before this instant are expired.
    ///
    /// `None` also when the window reaches past the earliest representable
    /// timestamp, in which case nothing of that status expires.
    pub fn cutoff_for(&self, status: TaskStatus, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window(status)
            .and_then(|window| now.checked_sub_signed(window))
    }
}

impl TaskStore {
    /// Delete expired terminal rows and hand them back so callers can clean
    /// up whatever the rows point at.
    pub fn purge_expired(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut db = self.lock();
        let tx = db.transaction()?;
        let mut purged = Vec::new();

        for status in TaskStatus::TERMINAL {
            let Some(cutoff) = policy.cutoff_for(status, now) else {
                continue;
            };
            let cutoff = encode_ts(&cutoff);

            {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = ?1 AND completed_at IS NOT NULL AND completed_at < ?2"
                ))?;
                let rows = stmt.query_map(params![status.as_str(), cutoff], task_from_row)?;
                for row in rows {
                    purged.push(row?);
                }
            }

            let deleted = tx.execute(
                "DELETE FROM tasks
                 WHERE status = ?1 AND completed_at IS NOT NULL AND completed_at < ?2",
                params![status.as_str(), cutoff],
            )?;
            debug!("Retention: {} {} rows older than {}", deleted, status, cutoff);
        }

        tx.commit()?;
        if !purged.is_empty() {
            info!("Cleaned up {} expired tasks", purged.len());
        }
        Ok(purged)
    }

    pub fn cleanup(&self, policy: &RetentionPolicy) -> Result<usize> {
        self.purge_expired(policy, Utc::now()).map(|purged| purged.len())
    }
}
