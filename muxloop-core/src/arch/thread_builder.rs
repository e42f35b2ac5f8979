//! Thread builder for creating and pinning worker threads

use std::io;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::arch::RuntimeMode;

/// Result of attempting to pin a thread to a specific core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningResult {
    /// Pinned to the requested core
    Success,
    /// Pinned, but to a different core than requested
    SuccessDifferentCore(usize),
    /// Pinning is not supported on this platform, or not requested
    Unsupported,
    Failed,
}

/// A spawned worker thread.
pub struct WorkerThread<T> {
    handle: JoinHandle<T>,
    /// The core this thread was assigned, if pinning was requested
    core_id: Option<usize>,
}

impl<T> WorkerThread<T> {
    pub fn core_id(&self) -> Option<usize> {
        self.core_id
    }

    pub fn name(&self) -> Option<&str> {
        self.handle.thread().name()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the thread; `Err` carries the panic payload.
    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }
}

/// Builder for dispatcher worker threads
pub struct ThreadBuilder {
    mode: RuntimeMode,
    /// Cores available for pinning
    cores: usize,
    /// Index of the next worker (incremented for each thread created)
    worker_idx: usize,
}

impl ThreadBuilder {
    pub fn new(mode: RuntimeMode) -> Self {
        Self::with_cores(mode, num_cpus::get())
    }

    pub fn with_cores(mode: RuntimeMode, cores: usize) -> Self {
        Self {
            mode,
            cores: cores.max(1),
            worker_idx: 0,
        }
    }

    /// Spawns a named worker thread, pinned if the mode asks for it.
    pub fn spawn<F, T>(&mut self, name: &str, f: F) -> io::Result<WorkerThread<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let core_id = self
            .mode
            .pins_threads()
            .then(|| self.worker_idx % self.cores);
        self.worker_idx += 1;

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            if let Some(core) = core_id {
                match pin_thread_to_core(core) {
                    PinningResult::Success => debug!(core, "worker pinned"),
                    result => warn!(core, ?result, "worker not pinned as requested"),
                }
            }
            f()
        })?;

        Ok(WorkerThread { handle, core_id })
    }
}

/// Attempt to pin the current thread to a specific CPU core
fn pin_thread_to_core(core_id: usize) -> PinningResult {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        return PinningResult::Unsupported;
    };

    if let Some(core) = core_ids.get(core_id) {
        if core_affinity::set_for_current(*core) {
            PinningResult::Success
        } else {
            PinningResult::Failed
        }
    } else if !core_ids.is_empty() {
        let fallback = core_id % core_ids.len();
        if core_affinity::set_for_current(core_ids[fallback]) {
            PinningResult::SuccessDifferentCore(fallback)
        } else {
            PinningResult::Failed
        }
    } else {
        PinningResult::Failed
    }
}
