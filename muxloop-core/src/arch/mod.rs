//! Thread layout for dispatchers
//!
//! This module is responsible for:
//! - Selecting a runtime mode from the available cores
//! - Building and pinning worker threads
//! - Running one dispatcher per worker on a shared port

pub mod partition;
pub mod runtime_mode;
pub mod thread_builder;

pub use partition::{run_partitioned, Partitions};
pub use runtime_mode::RuntimeMode;
pub use thread_builder::{PinningResult, ThreadBuilder, WorkerThread};

/// Select the most appropriate runtime mode for the current system
pub fn select_runtime_mode() -> RuntimeMode {
    RuntimeMode::detect()
}
