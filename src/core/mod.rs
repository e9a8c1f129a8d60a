pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod separator;
pub mod store;
pub mod task;
