//! Loaded-model cache for separators that run inference in process.
//!
//! Sized by `models.model_cache_size`; the external `CommandSeparator` has no
//! use for it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::core::pool::Device;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model_type: String,
    pub device: Device,
}

impl ModelKey {
    pub fn new(model_type: impl Into<String>, device: Device) -> Self {
        Self {
            model_type: model_type.into(),
            device,
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_type, self.device)
    }
}

struct Entries<M> {
    models: HashMap<ModelKey, Arc<M>>,
    /// Least recently used at the front.
    order: VecDeque<ModelKey>,
}

impl<M> Entries<M> {
    fn touch(&mut self, key: &ModelKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }
}

/// Loaded models kept per (model, device), bounded with LRU eviction.
///
/// Loading happens outside the lock, so two threads missing on the same key
/// may both load it; the first insert wins and the other copy is dropped.
pub struct ModelCache<M> {
    capacity: usize,
    entries: Mutex<Entries<M>>,
}

impl<M> ModelCache<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries {
                models: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<M>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.lock().models.contains_key(key)
    }

    /// Cached model, marking it most recently used.
    pub fn get(&self, key: &ModelKey) -> Option<Arc<M>> {
        let mut entries = self.lock();
        let model = entries.models.get(key).cloned()?;
        entries.touch(key);
        Some(model)
    }

    pub fn get_or_load<F>(&self, key: &ModelKey, load: F) -> anyhow::Result<Arc<M>>
    where
        F: FnOnce() -> anyhow::Result<M>,
    {
        if let Some(model) = self.get(key) {
            debug!("Model cache hit: {}", key);
            return Ok(model);
        }

        info!("Loading model {}", key);
        let model = Arc::new(load()?);
        if self.capacity == 0 {
            return Ok(model);
        }

        let mut entries = self.lock();
        if let Some(existing) = entries.models.get(key).cloned() {
            entries.touch(key);
            return Ok(existing);
        }
        while entries.models.len() >= self.capacity {
            let Some(evicted) = entries.order.pop_front() else {
                break;
            };
            entries.models.remove(&evicted);
            info!("Evicted model {} from cache", evicted);
        }
        entries.models.insert(key.clone(), Arc::clone(&model));
        entries.touch(key);
        Ok(model)
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.models.clear();
        entries.order.clear();
    }
}
