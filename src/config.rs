use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{Level, info};

use crate::core::error::{EngineError, Result};
use crate::core::orchestrator::RecoveryPolicy;

/// Engine configuration, built once at startup and shared by reference.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: WorkersConfig,
    pub models: ModelsConfig,
    pub files: FilesConfig,
    pub cleanup: CleanupConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub recovery: RecoveryConfig,
    pub separator: SeparatorConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WorkersConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How long shutdown waits for running jobs before giving up.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelsConfig {
    #[serde(default)]
    pub force_cpu: bool,

    /// CUDA ordinals to spread jobs over.
    #[serde(default = "default_device_ids")]
    pub device_ids: Vec<u32>,

    /// Capacity for in-process separators that keep loaded models in a
    /// [`crate::core::separator::ModelCache`]. `CommandSeparator` loads its
    /// models in the child process and ignores it.
    #[serde(default = "default_model_cache_size")]
    pub model_cache_size: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FilesConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_retention_hours")]
    pub completed_retention_hours: u32,

    #[serde(default = "default_retention_hours")]
    pub failed_retention_hours: u32,

    #[serde(default = "default_metadata_retention_days")]
    pub metadata_retention_days: u32,

    /// Six-field cron expression (seconds first).
    #[serde(default = "default_sweep_schedule")]
    pub sweep_schedule: String,

    /// Also remove the output files of purged tasks.
    #[serde(default = "default_true")]
    pub delete_artifacts: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// DEBUG, INFO, WARNING, ERROR or CRITICAL; case-insensitive.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub policy: RecoveryPolicy,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SeparatorConfig {
    #[serde(default = "default_separator_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,
}

fn default_max_workers() -> usize {
    1
}
fn default_shutdown_timeout_secs() -> u64 {
    300
}
fn default_device_ids() -> Vec<u32> {
    vec![0]
}
fn default_model_cache_size() -> usize {
    3
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./api_outputs")
}
fn default_true() -> bool {
    true
}
fn default_retention_hours() -> u32 {
    24
}
fn default_metadata_retention_days() -> u32 {
    7
}
fn default_sweep_schedule() -> String {
    "0 0 * * * *".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./api_server.db")
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_separator_command() -> String {
    "python3".to_string()
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            force_cpu: false,
            device_ids: default_device_ids(),
            model_cache_size: default_model_cache_size(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            completed_retention_hours: default_retention_hours(),
            failed_retention_hours: default_retention_hours(),
            metadata_retention_days: default_metadata_retention_days(),
            sweep_schedule: default_sweep_schedule(),
            delete_artifacts: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for SeparatorConfig {
    fn default() -> Self {
        Self {
            command: default_separator_command(),
            args: Vec::new(),
        }
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> Result<Level> {
        match self.level.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Level::TRACE),
            "DEBUG" => Ok(Level::DEBUG),
            "INFO" => Ok(Level::INFO),
            "WARNING" | "WARN" => Ok(Level::WARN),
            "ERROR" | "CRITICAL" => Ok(Level::ERROR),
            other => Err(EngineError::Config(format!(
                "logging.level: unknown level '{}'",
                other
            ))),
        }
    }
}

impl EngineConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config found at {}, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(
            "Loaded config from {}: workers={}, devices={:?}, cpu={}, db={}",
            path.display(),
            config.workers.max_workers,
            config.models.device_ids,
            config.models.force_cpu,
            config.database.path.display()
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EngineError::Config(msg.to_string()));
        if self.workers.max_workers == 0 {
            return fail("workers.max_workers must be at least 1");
        }
        if !self.models.force_cpu && self.models.device_ids.is_empty() {
            return fail("models.device_ids must list at least one device unless force_cpu is set");
        }
        if self.cleanup.completed_retention_hours == 0 || self.cleanup.failed_retention_hours == 0 {
            return fail("cleanup retention hours must be positive");
        }
        if self.cleanup.metadata_retention_days == 0 {
            return fail("cleanup.metadata_retention_days must be positive");
        }
        if self.cleanup.enabled && self.cleanup.sweep_schedule.split_whitespace().count() != 6 {
            return fail("cleanup.sweep_schedule must be a six-field cron expression");
        }
        if self.separator.command.trim().is_empty() {
            return fail("separator.command must not be empty");
        }
        self.logging.tracing_level()?;
        Ok(())
    }
}
