//! The seam to the actual separation routine.

pub mod cache;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::{debug, info};

use crate::config::SeparatorConfig;
use crate::core::pool::Device;
use crate::core::progress::ProgressListener;
use crate::core::task::{OutputFiles, SeparationParams};

pub use cache::{ModelCache, ModelKey};

/// Everything a separation run needs, fixed before it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparationRequest {
    pub task_id: String,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub params: SeparationParams,
    pub device: Device,
}

/// A blocking separation routine.
///
/// Implementations report progress through `listener` and return the
/// instrument to file mapping they produced. They run on a pool thread and
/// may block for minutes.
pub trait Separator: Send + Sync {
    fn separate(
        &self,
        request: &SeparationRequest,
        listener: &dyn ProgressListener,
    ) -> Result<OutputFiles>;
}

/// Lines an external separator prints on stdout.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProtocolLine {
    Outputs {
        outputs: OutputFiles,
    },
    Progress {
        progress: f64,
        #[serde(default)]
        stage: String,
    },
}

/// Runs an external program per task.
///
/// The request goes to the child's stdin as one JSON document. The child
/// prints JSON lines on stdout: `{"progress": 42.0, "stage": "..."}` while
/// working and `{"outputs": {"vocals": "/path/vocals.wav"}}` once done.
/// Anything else on stdout is logged and ignored.
pub struct CommandSeparator {
    program: String,
    args: Vec<String>,
}

impl CommandSeparator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &SeparatorConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

impl Separator for CommandSeparator {
    fn separate(
        &self,
        request: &SeparationRequest,
        listener: &dyn ProgressListener,
    ) -> Result<OutputFiles> {
        info!(
            "Running separator [{}] for task {} on {}",
            self.program, request.task_id, request.device
        );
        std::fs::create_dir_all(&request.output_dir).with_context(|| {
            format!(
                "creating output directory {}",
                request.output_dir.display()
            )
        })?;

        let request_json = serde_json::to_vec(request)?;
        let child = Command::new(&self.program)
            .args(&self.args)
            .env("STEMFORGE_TASK_ID", &request.task_id)
            .env("STEMFORGE_DEVICE", request.device.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning separator '{}'", self.program))?;
        let mut child = ChildGuard::new(child);

        if let Some(mut stdin) = child.inner.stdin.take()
            && let Err(e) = stdin.write_all(&request_json)
        {
            // The child may legitimately exit without reading stdin.
            debug!("Separator closed stdin early: {}", e);
        }

        // Drain stderr on its own thread so a chatty child cannot block on a
        // full pipe while we wait on stdout.
        let stderr_reader = child.inner.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let mut outputs = None;
        if let Some(stdout) = child.inner.stdout.take() {
            for line in BufReader::new(stdout).split(b'\n') {
                let line = line.context("reading separator output")?;
                let line = String::from_utf8_lossy(&line);
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ProtocolLine>(trimmed) {
                    Ok(ProtocolLine::Progress { progress, stage }) => {
                        listener.on_progress(progress, &stage);
                    }
                    Ok(ProtocolLine::Outputs { outputs: files }) => outputs = Some(files),
                    Err(_) => debug!("[{}] {}", request.task_id, trimmed),
                }
            }
        }

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            bail!(
                "separator exited with {}: {}",
                status,
                stderr_tail(&stderr)
            );
        }
        if !stderr.trim().is_empty() {
            debug!(
                "Separator stderr for task {}: {}",
                request.task_id,
                stderr_tail(&stderr)
            );
        }

        outputs.context("separator finished without reporting output files")
    }
}

/// Kills and reaps the child unless it was waited on to completion.
struct ChildGuard {
    inner: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(inner: Child) -> Self {
        Self {
            inner,
            reaped: false,
        }
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.inner.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            debug!("Killing separator process {}", self.inner.id());
            let _ = self.inner.kill();
            let _ = self.inner.wait();
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    const MAX_LINES: usize = 20;
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(MAX_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests;
