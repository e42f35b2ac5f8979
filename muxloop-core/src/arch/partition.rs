//! Partitioned scaling: one dispatcher per worker thread.
//!
//! Every partition binds its own `SO_REUSEPORT` listener on the same
//! address and the kernel spreads incoming connections across them. Each
//! partition owns its descriptors outright, so nothing is shared or locked
//! between dispatchers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};

use crate::arch::{RuntimeMode, ThreadBuilder, WorkerThread};
use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, DispatcherHandle, Handler};
use crate::error::{Error, Result};

/// One running partition.
struct Partition {
    handle: DispatcherHandle,
    thread: WorkerThread<Result<()>>,
}

/// Running partitions started by [`run_partitioned`].
pub struct Partitions {
    local_addr: SocketAddr,
    partitions: Vec<Partition>,
}

impl Partitions {
    /// The address every partition listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn handles(&self) -> Vec<DispatcherHandle> {
        self.partitions.iter().map(|p| p.handle.clone()).collect()
    }

    /// Asks every partition to shut down.
    pub fn stop(&self) {
        for partition in &self.partitions {
            partition.handle.stop();
        }
    }

    /// Waits for every partition and returns the first failure.
    pub fn join(self) -> Result<()> {
        let mut first_err = None;
        for partition in self.partitions {
            let name = partition.thread.name().unwrap_or("partition").to_string();
            let outcome = match partition.thread.join() {
                Ok(result) => result,
                Err(_) => Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{name} panicked"),
                ))),
            };
            if let Err(err) = outcome {
                error!(partition = %name, error = %err, "partition failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Starts one dispatcher per worker of `mode`, all listening on
/// `config.socket_addr()`.
///
/// `factory` builds the handler for each partition on its own thread, so
/// handlers need not be `Send`. Partitions are started one at a time; with
/// port 0 the first partition picks the port and the rest join it.
pub fn run_partitioned<H, F>(config: ServerConfig, mode: RuntimeMode, factory: F) -> Result<Partitions>
where
    H: Handler,
    F: Fn(usize) -> H + Send + Sync + 'static,
{
    let mut config = config;
    config.validate()?;
    if mode.needs_reuse_port() {
        config.reuse_port = true;
    }

    let factory = Arc::new(factory);
    let mut builder = ThreadBuilder::new(mode.clone());
    let mut partitions: Vec<Partition> = Vec::with_capacity(mode.worker_count());
    let mut local_addr = config.socket_addr();

    info!(mode = %mode.description(), addr = %local_addr, "starting partitions");

    for index in 0..mode.worker_count() {
        let worker_config = config.clone();
        let factory = Arc::clone(&factory);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let spawned = builder.spawn(&format!("muxloop-{index}"), move || -> Result<()> {
            let started = Dispatcher::new(worker_config, (*factory)(index)).and_then(|mut d| {
                let addr = d.bind()?;
                Ok((d, addr))
            });
            let mut dispatcher = match started {
                Ok((dispatcher, addr)) => {
                    let _ = ready_tx.send(Ok((dispatcher.handle(), addr)));
                    dispatcher
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };
            dispatcher.run()
        });

        let startup = spawned
            .map_err(Error::from)
            .and_then(|thread| match ready_rx.recv() {
                Ok(Ok((handle, addr))) => Ok((thread, handle, addr)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::Disconnected),
            });

        match startup {
            Ok((thread, handle, addr)) => {
                local_addr = addr;
                config.port = addr.port();
                partitions.push(Partition { handle, thread });
            }
            Err(err) => {
                error!(partition = index, error = %err, "partition failed to start");
                let started = Partitions {
                    local_addr,
                    partitions,
                };
                started.stop();
                let _ = started.join();
                return Err(err);
            }
        }
    }

    Ok(Partitions {
        local_addr,
        partitions,
    })
}
