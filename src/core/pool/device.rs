use std::fmt;

use crate::config::ModelsConfig;

/// A compute device a job runs on, named the way torch names them
/// (`cpu`, `cuda:0`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Device(String);

impl Device {
    pub fn cpu() -> Self {
        Self("cpu".to_string())
    }

    pub fn cuda(id: u32) -> Self {
        Self(format!("cuda:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_cpu(&self) -> bool {
        self.0 == "cpu"
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Device {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Worker count and device list for a configuration.
///
/// CPU mode always runs a single worker on the `cpu` device: separation
/// models are memory heavy and parallel CPU runs exhaust RAM quickly.
pub fn plan_devices(models: &ModelsConfig, max_workers: usize) -> (usize, Vec<Device>) {
    if models.force_cpu {
        return (1, vec![Device::cpu()]);
    }
    let devices = if models.device_ids.is_empty() {
        vec![Device::cuda(0)]
    } else {
        models.device_ids.iter().copied().map(Device::cuda).collect()
    };
    (max_workers.max(1), devices)
}
