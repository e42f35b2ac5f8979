//! Runtime modes
//!
//! A runtime mode decides how many dispatchers run and whether their
//! threads are pinned to cores.

use std::fmt;

/// How dispatchers are laid out over threads.
#[derive(Clone, PartialEq, Eq)]
pub enum RuntimeMode {
    /// One dispatcher on the calling thread's worker.
    SingleThread,

    /// One dispatcher per worker thread, each with its own listener on the
    /// shared port. Connections never move between partitions.
    Partitioned {
        /// Number of dispatcher threads.
        workers: usize,
        /// Pin each worker to its own core.
        pin: bool,
    },
}

impl fmt::Debug for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleThread => write!(f, "SingleThread"),
            Self::Partitioned { workers, pin } => {
                write!(f, "Partitioned(workers={}, pin={})", workers, pin)
            }
        }
    }
}

impl RuntimeMode {
    /// Picks a mode for this machine.
    pub fn detect() -> Self {
        Self::select_for_cores(num_cpus::get())
    }

    /// Picks a mode for a machine with `logical_cores` cores.
    pub fn select_for_cores(logical_cores: usize) -> Self {
        if logical_cores <= 1 {
            return Self::SingleThread;
        }

        // Leave one core for the rest of the system on larger machines.
        let workers = if logical_cores <= 4 {
            logical_cores
        } else {
            logical_cores - 1
        };

        Self::Partitioned { workers, pin: true }
    }

    pub fn worker_count(&self) -> usize {
        match self {
            Self::SingleThread => 1,
            Self::Partitioned { workers, .. } => (*workers).max(1),
        }
    }

    pub fn pins_threads(&self) -> bool {
        matches!(self, Self::Partitioned { pin: true, .. })
    }

    /// Partitions share a port through `SO_REUSEPORT`.
    pub fn needs_reuse_port(&self) -> bool {
        self.worker_count() > 1
    }

    pub fn description(&self) -> String {
        match self {
            Self::SingleThread => "single dispatcher".to_string(),
            Self::Partitioned { workers, pin } => format!(
                "{} partitioned dispatchers (pinned: {})",
                workers,
                if *pin { "yes" } else { "no" }
            ),
        }
    }
}
