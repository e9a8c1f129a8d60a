use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::Device;

/// How a submitted job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// The work function returned an error or panicked.
    Failed(String),
    /// Removed from the queue before a worker picked it up.
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }
}

/// Write-once outcome cell shared by the pool and every handle clone.
#[derive(Default)]
pub(super) struct Slot {
    outcome: Mutex<Option<JobOutcome>>,
    resolved: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Option<JobOutcome>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First resolution wins.
    pub(super) fn resolve(&self, outcome: JobOutcome) {
        let mut current = self.lock();
        if current.is_none() {
            *current = Some(outcome);
            self.resolved.notify_all();
        }
    }
}

/// Result handle returned by [`super::WorkerPool::submit`].
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    device: Device,
    slot: Arc<Slot>,
}

impl JobHandle {
    pub(super) fn new(id: String, device: Device, slot: Arc<Slot>) -> Self {
        Self { id, device, slot }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Device assigned at submission time.
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.slot.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn wait(&self) -> JobOutcome {
        let mut outcome = self.slot.lock();
        loop {
            if let Some(done) = outcome.as_ref() {
                return done.clone();
            }
            outcome = self
                .slot
                .resolved
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// `None` if the job is still queued or running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.slot.lock();
        loop {
            if let Some(done) = outcome.as_ref() {
                return Some(done.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            outcome = self
                .slot
                .resolved
                .wait_timeout(outcome, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("outcome", &self.outcome())
            .finish()
    }
}
