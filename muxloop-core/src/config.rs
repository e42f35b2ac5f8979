//! Dispatcher configuration.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! port = 9000
//! buffer_capacity = 65536
//!
//! [logging]
//! level = "debug"
//! ```

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Configuration for a dispatcher and its listeners.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address listeners bind to.
    pub address: IpAddr,

    /// Port listeners bind to; 0 picks an ephemeral port.
    pub port: u16,

    /// Kernel accept-queue length for each listener.
    pub backlog: u32,

    /// Maximum connections accepted per readiness event.
    pub accept_batch: usize,

    /// How long a listener stops accepting after running out of
    /// descriptors, in milliseconds.
    pub accept_backoff_ms: u64,

    /// Capacity of each connection's inbound buffer and outbound segments.
    pub buffer_capacity: usize,

    /// Upper bound on one multiplexer wait, in milliseconds.
    pub poll_timeout_ms: u64,

    /// Time open connections get to drain after a stop request, in milliseconds.
    pub shutdown_grace_ms: u64,

    /// Set `TCP_NODELAY` on every connection.
    pub nodelay: bool,

    /// Set `SO_REUSEPORT` on listeners. Forced on for partitioned runs.
    pub reuse_port: bool,

    /// Initial capacity of the per-cycle event list.
    pub event_capacity: usize,

    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::from([127, 0, 0, 1]),
            port: 7878,
            backlog: 128,
            accept_batch: 64,
            accept_backoff_ms: 50,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            poll_timeout_ms: 100,
            shutdown_grace_ms: 5_000,
            nodelay: true,
            reuse_port: false,
            event_capacity: 1024,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(Error::Config("buffer_capacity must be non-zero".to_string()));
        }
        if self.accept_batch == 0 {
            return Err(Error::Config("accept_batch must be non-zero".to_string()));
        }
        if self.backlog == 0 {
            return Err(Error::Config("backlog must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}

/// Log output settings. `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `"info"` or `"muxloop_core=debug"`.
    pub level: String,

    /// Colored output.
    pub ansi: bool,

    /// Include the thread name in each line (useful for partitioned runs).
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
            thread_names: false,
        }
    }
}
