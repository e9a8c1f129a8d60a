//! Bounded pool of OS worker threads for blocking separation jobs.
//!
//! Jobs are queued FIFO on a channel and each worker runs one job at a time
//! to completion. Devices are handed out round-robin when a job is
//! submitted, not when it starts. A job that errors or panics is recorded on
//! its handle and never takes its worker down.

mod device;
mod handle;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::config::{ModelsConfig, WorkersConfig};
use crate::core::error::{EngineError, Result};

pub use device::{Device, plan_devices};
pub use handle::{JobHandle, JobOutcome};
use handle::Slot;

/// Work executed on a pool thread with the device it was assigned.
pub type Work = Box<dyn FnOnce(&Device) -> anyhow::Result<()> + Send + 'static>;

struct Job {
    id: String,
    device: Device,
    work: Work,
    slot: Arc<Slot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Running,
}

struct Tracked {
    state: JobState,
    slot: Arc<Slot>,
}

struct State {
    jobs: HashMap<String, Tracked>,
    cursor: usize,
    /// `None` once shut down; dropping it lets idle workers exit.
    sender: Option<Sender<Job>>,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    devices: Vec<Device>,
    max_workers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, devices: Vec<Device>) -> Result<Self> {
        let max_workers = max_workers.max(1);
        let devices = if devices.is_empty() {
            vec![Device::cpu()]
        } else {
            devices
        };

        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: HashMap::new(),
                cursor: 0,
                sender: Some(sender),
            }),
            changed: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(max_workers);
        for n in 0..max_workers {
            let shared = Arc::clone(&shared);
            let receiver = receiver.clone();
            let worker = std::thread::Builder::new()
                .name(format!("stemforge-worker-{n}"))
                .spawn(move || worker_loop(shared, receiver))?;
            workers.push(worker);
        }

        info!(
            "Worker pool started: {} workers on [{}]",
            max_workers,
            devices
                .iter()
                .map(Device::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            shared,
            devices,
            max_workers,
            workers: Mutex::new(workers),
        })
    }

    pub fn from_config(workers: &WorkersConfig, models: &ModelsConfig) -> Result<Self> {
        let (max_workers, devices) = plan_devices(models, workers.max_workers);
        if models.force_cpu && workers.max_workers > 1 {
            warn!(
                "CPU mode: ignoring max_workers={} and running a single worker",
                workers.max_workers
            );
        }
        Self::new(max_workers, devices)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Queue `work` under `id`. The device is fixed here, round-robin over
    /// the configured list.
    pub fn submit<F>(&self, id: impl Into<String>, work: F) -> Result<JobHandle>
    where
        F: FnOnce(&Device) -> anyhow::Result<()> + Send + 'static,
    {
        let id = id.into();
        let mut state = self.shared.lock();

        let Some(sender) = state.sender.clone() else {
            return Err(EngineError::PoolShutdown);
        };
        if state.jobs.contains_key(&id) {
            return Err(EngineError::DuplicateTask(id));
        }

        let device = self.devices[state.cursor % self.devices.len()].clone();
        state.cursor = state.cursor.wrapping_add(1);

        let slot = Arc::new(Slot::default());
        state.jobs.insert(
            id.clone(),
            Tracked {
                state: JobState::Queued,
                slot: Arc::clone(&slot),
            },
        );

        let job = Job {
            id: id.clone(),
            device: device.clone(),
            work: Box::new(work),
            slot: Arc::clone(&slot),
        };
        if sender.send(job).is_err() {
            // Every worker thread is gone.
            state.jobs.remove(&id);
            return Err(EngineError::PoolShutdown);
        }

        debug!("Queued job {} on {}", id, device);
        Ok(JobHandle::new(id, device, slot))
    }

    /// Drop a job that has not started yet. Running jobs cannot be stopped.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.shared.lock();
        let queued = matches!(
            state.jobs.get(id),
            Some(Tracked {
                state: JobState::Queued,
                ..
            })
        );
        if !queued {
            return false;
        }
        if let Some(tracked) = state.jobs.remove(id) {
            tracked.slot.resolve(JobOutcome::Cancelled);
        }
        self.shared.changed.notify_all();
        info!("Cancelled queued job {}", id);
        true
    }

    /// Jobs currently executing on a worker.
    pub fn active_count(&self) -> usize {
        self.shared
            .lock()
            .jobs
            .values()
            .filter(|t| t.state == JobState::Running)
            .count()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .lock()
            .jobs
            .iter()
            .filter(|(_, t)| t.state == JobState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.shared
            .lock()
            .jobs
            .get(id)
            .is_some_and(|t| t.state == JobState::Running)
    }

    pub fn queued_count(&self) -> usize {
        self.shared
            .lock()
            .jobs
            .values()
            .filter(|t| t.state == JobState::Queued)
            .count()
    }

    /// Queued or running.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.shared.lock().jobs.contains_key(id)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().sender.is_none()
    }

    /// Stop accepting jobs. Already queued jobs still run.
    ///
    /// With `wait`, blocks until every tracked job has resolved or `timeout`
    /// elapses. Returns whether the pool had drained.
    pub fn shutdown(&self, wait: bool, timeout: Option<Duration>) -> bool {
        let mut state = self.shared.lock();
        if state.sender.take().is_some() {
            info!(
                "Shutting down worker pool ({} jobs outstanding)",
                state.jobs.len()
            );
        }
        if !wait {
            return state.jobs.is_empty();
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while !state.jobs.is_empty() {
            match deadline {
                None => {
                    state = self
                        .shared
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        warn!(
                            "Worker pool shutdown timed out with {} jobs outstanding",
                            state.jobs.len()
                        );
                        return false;
                    };
                    state = self
                        .shared
                        .changed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        drop(state);

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if worker.join().is_err() {
                error!("Worker thread exited abnormally");
            }
        }
        info!("Worker pool drained");
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.lock().sender.take();
    }
}

fn worker_loop(shared: Arc<Shared>, receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if !claim(&shared, &job) {
            debug!("Skipping cancelled job {}", job.id);
            continue;
        }

        let Job {
            id,
            device,
            work,
            slot,
        } = job;
        debug!("Running job {} on {}", id, device);

        let outcome = match catch_unwind(AssertUnwindSafe(|| work(&device))) {
            Ok(Ok(())) => JobOutcome::Succeeded,
            Ok(Err(e)) => {
                error!("Job {} failed: {:#}", id, e);
                JobOutcome::Failed(format!("{e:#}"))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Job {} panicked: {}", id, message);
                JobOutcome::Failed(format!("worker panicked: {message}"))
            }
        };

        // Untrack and resolve under one lock so a drained pool never has an
        // unresolved handle and a resolved handle is never still tracked.
        let mut state = shared.lock();
        if state
            .jobs
            .get(&id)
            .is_some_and(|t| Arc::ptr_eq(&t.slot, &slot))
        {
            state.jobs.remove(&id);
        }
        slot.resolve(outcome);
        shared.changed.notify_all();
    }
}

/// Mark the job running unless it was cancelled (or replaced) while queued.
fn claim(shared: &Shared, job: &Job) -> bool {
    let mut state = shared.lock();
    match state.jobs.get_mut(&job.id) {
        Some(tracked) if Arc::ptr_eq(&tracked.slot, &job.slot) => {
            tracked.state = JobState::Running;
            shared.changed.notify_all();
            true
        }
        _ => false,
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
