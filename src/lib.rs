//! Task processing engine for long-running audio separation jobs.
//!
//! [`crate::core::store::TaskStore`] keeps every task durable,
//! [`crate::core::pool::WorkerPool`] runs a bounded number of them on OS threads
//! spread over the configured devices, and [`crate::core::orchestrator::Orchestrator`]
//! ties both to a [`crate::core::separator::Separator`] and handles recovery and
//! retention.

pub mod config;
pub mod core;
pub mod logging;

pub use config::EngineConfig;
pub use crate::core::error::{EngineError, Result};
pub use crate::core::orchestrator::{JobRequest, Orchestrator};
pub use crate::core::task::{Task, TaskStatus};
