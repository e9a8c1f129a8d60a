//! Durable task records backed by SQLite.
//!
//! One connection sits behind a mutex, so every public call is a short,
//! self-contained transaction. Rows are only ever mutated by the worker that
//! owns the task and by the retention sweep, which touches terminal rows only.

mod codec;
mod retention;
mod tasks;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

use crate::core::error::Result;

pub use retention::RetentionPolicy;
pub use tasks::{StatusUpdate, TaskFilter};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TaskStore {
    db: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl TaskStore {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Connection::open(&path)?;
        db.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = db.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        initialize_schema(&db)?;

        info!(
            "Task store opened at {} (journal_mode={})",
            path.display(),
            mode
        );
        Ok(Self {
            db: Mutex::new(db),
            path: Some(path),
        })
    }

    /// Private in-memory database, used by tests and throwaway engines.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        initialize_schema(&db)?;
        Ok(Self {
            db: Mutex::new(db),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // A panic while holding the lock cannot leave a half-applied statement
    // behind: every write runs inside its own transaction.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn initialize_schema(db: &Connection) -> Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            input_file_path TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL,
            model_type TEXT NOT NULL,
            config_path TEXT NOT NULL,
            instruments TEXT NOT NULL,
            use_tta INTEGER NOT NULL DEFAULT 0,
            extract_instrumental INTEGER NOT NULL DEFAULT 0,
            output_format TEXT NOT NULL DEFAULT 'wav',
            pcm_type TEXT NOT NULL DEFAULT 'PCM_24',
            progress REAL NOT NULL DEFAULT 0.0,
            current_stage TEXT,
            estimated_completion TEXT,
            output_files TEXT,
            error_message TEXT,
            processing_time_seconds REAL
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_completed_at ON tasks(completed_at)",
        [],
    )?;

    Ok(())
}
