mod recovery;
mod retention;

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::core::orchestrator::{JobRequest, Orchestrator};
use crate::core::pool::{Device, WorkerPool};
use crate::core::progress::ProgressListener;
use crate::core::separator::{SeparationRequest, Separator};
use crate::core::store::TaskStore;
use crate::core::task::{OutputFiles, SeparationParams};

type Behavior =
    dyn Fn(&SeparationRequest, &dyn ProgressListener) -> anyhow::Result<OutputFiles> + Send + Sync;

/// Separator whose behaviour is a closure, for driving the orchestrator.
pub(super) struct FakeSeparator {
    behavior: Box<Behavior>,
}

impl FakeSeparator {
    pub(super) fn new<F>(behavior: F) -> Arc<Self>
    where
        F: Fn(&SeparationRequest, &dyn ProgressListener) -> anyhow::Result<OutputFiles>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            behavior: Box::new(behavior),
        })
    }

    /// Reports a few phases and writes one stem per requested instrument.
    pub(super) fn writing_stems() -> Arc<Self> {
        Self::new(|request, listener| {
            listener.on_progress(5.0, "Loading model");
            listener.on_progress(43.75, "Processing chunks (25/100)");
            listener.on_progress(90.0, "Saving outputs");
            write_stems(request)
        })
    }
}

impl Separator for FakeSeparator {
    fn separate(
        &self,
        request: &SeparationRequest,
        listener: &dyn ProgressListener,
    ) -> anyhow::Result<OutputFiles> {
        (self.behavior)(request, listener)
    }
}

pub(super) fn write_stems(request: &SeparationRequest) -> anyhow::Result<OutputFiles> {
    std::fs::create_dir_all(&request.output_dir)?;
    let mut outputs = OutputFiles::new();
    for instrument in &request.params.instruments {
        let path = request.output_dir.join(format!("{instrument}.wav"));
        std::fs::write(&path, b"RIFF")?;
        outputs.insert(instrument.clone(), path);
    }
    Ok(outputs)
}

pub(super) struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<TaskStore>,
    pub dir: TempDir,
}

impl Harness {
    pub(super) fn new(separator: Arc<dyn Separator>) -> Self {
        Self::with_config(EngineConfig::default(), 1, separator)
    }

    pub(super) fn with_config(
        mut config: EngineConfig,
        workers: usize,
        separator: Arc<dyn Separator>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.files.output_dir = dir.path().join("outputs");
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        Self::build(config, workers, store, dir, separator)
    }

    /// A fresh orchestrator over an existing store, as after a restart.
    pub(super) fn build(
        config: EngineConfig,
        workers: usize,
        store: Arc<TaskStore>,
        dir: TempDir,
        separator: Arc<dyn Separator>,
    ) -> Self {
        let devices = (0..workers as u32).map(Device::cuda).collect();
        let pool = Arc::new(WorkerPool::new(workers, devices).unwrap());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(config),
            Arc::clone(&store),
            pool,
            separator,
        ));
        Self {
            orchestrator,
            store,
            dir,
        }
    }

    pub(super) fn input(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        path
    }

    pub(super) fn request(&self, id: &str) -> JobRequest {
        JobRequest::new(self.input(&format!("{id}.wav")), params()).with_id(id)
    }
}

pub(super) fn params() -> SeparationParams {
    SeparationParams::new(
        "mdx23c",
        "configs/config_vocals_mdx23c.yaml",
        vec!["vocals".into(), "instrumental".into()],
    )
}
