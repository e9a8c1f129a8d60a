use std::path::PathBuf;

use crate::core::task::SeparationParams;

/// A separation job as handed in by the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Generated (UUID v4) when not supplied.
    pub task_id: Option<String>,
    pub input_path: PathBuf,
    pub params: SeparationParams,
}

impl JobRequest {
    pub fn new(input_path: impl Into<PathBuf>, params: SeparationParams) -> Self {
        Self {
            task_id: None,
            input_path: input_path.into(),
            params,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// What startup does with tasks a previous process left unfinished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Record them as `Failed` with a restart message.
    #[default]
    MarkFailed,
    /// Queue them again with their stored parameters.
    Resubmit,
    /// Leave them untouched for an operator to resubmit or cancel.
    Manual,
}

impl RecoveryPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryPolicy::MarkFailed => "mark_failed",
            RecoveryPolicy::Resubmit => "resubmit",
            RecoveryPolicy::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Every orphaned task found, oldest first.
    pub found: Vec<String>,
    pub marked_failed: Vec<String>,
    pub resubmitted: Vec<String>,
    pub left_for_operator: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }
}

/// Message recorded on tasks failed by [`RecoveryPolicy::MarkFailed`].
pub const RESTART_MESSAGE: &str = "Server restarted before the task finished";
