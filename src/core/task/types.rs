use std::collections::BTreeMap;
use std::path::PathBuf;

/// Instrument name → path of the rendered stem.
pub type OutputFiles = BTreeMap<String, PathBuf>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const TERMINAL: [TaskStatus; 3] = [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Wav,
    Flac,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Wav => "wav",
            OutputFormat::Flac => "flac",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "wav" => Some(OutputFormat::Wav),
            "flac" => Some(OutputFormat::Flac),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PcmType {
    #[serde(rename = "PCM_16")]
    Pcm16,
    #[default]
    #[serde(rename = "PCM_24")]
    Pcm24,
}

impl PcmType {
    pub fn as_str(self) -> &'static str {
        match self {
            PcmType::Pcm16 => "PCM_16",
            PcmType::Pcm24 => "PCM_24",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "PCM_16" => Some(PcmType::Pcm16),
            "PCM_24" => Some(PcmType::Pcm24),
            _ => None,
        }
    }
}

/// The uploaded audio file a task works on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InputFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Processing parameters, fixed once the task is created.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SeparationParams {
    pub model_type: String,
    pub config_path: String,
    pub instruments: Vec<String>,
    #[serde(default)]
    pub use_tta: bool,
    #[serde(default)]
    pub extract_instrumental: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub pcm_type: PcmType,
}

impl SeparationParams {
    pub fn new(
        model_type: impl Into<String>,
        config_path: impl Into<String>,
        instruments: Vec<String>,
    ) -> Self {
        Self {
            model_type: model_type.into(),
            config_path: config_path.into(),
            instruments,
            use_tta: false,
            extract_instrumental: false,
            output_format: OutputFormat::default(),
            pcm_type: PcmType::default(),
        }
    }
}
