//! Cross-thread access to a running dispatcher.
//!
//! Other threads never touch connections directly. They queue a
//! [`Command`] and wake the dispatcher through a socket pair registered
//! with its multiplexer; the dispatcher applies commands on its own thread
//! at the start of the next batch.

use crate::error::{Error, Result};
use crate::net::ConnId;
use crossbeam_channel::{Receiver, Sender};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Work handed to the dispatcher from another thread.
#[derive(Debug)]
pub enum Command {
    /// Queue bytes on a connection.
    Send(ConnId, Vec<u8>),
    /// Gracefully close a connection.
    Close(ConnId),
    /// Begin shutdown.
    Stop,
}

/// State shared between the dispatcher and its handles.
#[derive(Debug)]
pub(crate) struct Shared {
    stop: AtomicBool,
    /// Set while a wake byte is in flight, so bursts of commands cost one write.
    wake_pending: AtomicBool,
    wake_tx: UnixStream,
}

impl Shared {
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if self.wake_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        match (&self.wake_tx).write(&[1]) {
            Ok(_) => {}
            // The pipe is full, so a wake-up is already queued.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "failed to wake dispatcher"),
        }
    }
}

/// Receiving side, owned by the dispatcher.
#[derive(Debug)]
pub(crate) struct Mailbox {
    pub(crate) shared: Arc<Shared>,
    pub(crate) wake_rx: UnixStream,
    pub(crate) commands: Receiver<Command>,
    tx: Sender<Command>,
}

impl Mailbox {
    pub(crate) fn new() -> io::Result<Self> {
        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;

        let (tx, commands) = crossbeam_channel::unbounded();
        Ok(Self {
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                wake_pending: AtomicBool::new(false),
                wake_tx,
            }),
            wake_rx,
            commands,
            tx,
        })
    }

    pub(crate) fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Empties the wake socket. Must run before the command queue is drained
    /// so a command queued afterwards triggers a fresh wake-up.
    pub(crate) fn drain_wake(&self) {
        self.shared.wake_pending.store(false, Ordering::Release);

        let mut scratch = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

/// A cloneable, thread-safe handle to a dispatcher.
///
/// # Examples
///
/// ```no_run
/// # use muxloop_core::dispatch::DispatcherHandle;
/// # fn demo(handle: DispatcherHandle) {
/// let stopper = handle.clone();
/// std::thread::spawn(move || stopper.stop());
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: Sender<Command>,
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    /// Queues `bytes` for sending on `conn`.
    ///
    /// Unknown or already closed connections are ignored by the dispatcher.
    pub fn send(&self, conn: ConnId, bytes: Vec<u8>) -> Result<()> {
        self.submit(Command::Send(conn, bytes))
    }

    /// Gracefully closes `conn`.
    pub fn close(&self, conn: ConnId) -> Result<()> {
        self.submit(Command::Close(conn))
    }

    /// Requests shutdown. Open connections get the configured grace period
    /// to drain.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        // The flag alone is enough; the command only fails if the
        // dispatcher has already gone away.
        let _ = self.submit(Command::Stop);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stop_requested()
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::Disconnected)?;
        self.shared.wake();
        Ok(())
    }
}
