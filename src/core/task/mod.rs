pub mod types;

use chrono::{DateTime, Utc};
use std::path::PathBuf;

pub use types::{InputFile, OutputFiles, OutputFormat, PcmType, SeparationParams, TaskStatus};

/// One audio-separation job, as persisted in the task store.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub input: InputFile,
    pub params: SeparationParams,

    pub progress: f64,
    pub current_stage: Option<String>,
    pub estimated_completion: Option<DateTime<Utc>>,

    pub output_files: Option<OutputFiles>,
    pub error_message: Option<String>,
    pub processing_time_seconds: Option<f64>,
}

impl Task {
    /// A fresh `Pending` task created now.
    pub fn new(
        task_id: impl Into<String>,
        input_path: impl Into<PathBuf>,
        size_bytes: u64,
        params: SeparationParams,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input: InputFile {
                path: input_path.into(),
                size_bytes,
            },
            params,
            progress: 0.0,
            current_stage: None,
            estimated_completion: None,
            output_files: None,
            error_message: None,
            processing_time_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Whether a stored status may move from `from` to `to`.
///
/// Non-terminal self transitions are allowed so progress updates can repeat
/// the current status. Terminal states accept nothing.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    match from {
        TaskStatus::Pending => true,
        TaskStatus::Processing => to != TaskStatus::Pending,
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => false,
    }
}

/// Status that ends up stored when `requested` is applied to `current`.
pub fn resolve_transition(current: TaskStatus, requested: TaskStatus) -> TaskStatus {
    if can_transition(current, requested) {
        requested
    } else {
        current
    }
}
