//! Error taxonomy for the connection-handling core.
//!
//! Per-connection failures never leave the dispatcher: they are resolved
//! into a [`CloseReason`](crate::net::CloseReason) handed to `on_close`.
//! Only [`Error::FatalMultiplexer`] (and setup failures such as a failed
//! bind) are returned to the caller of [`Dispatcher::run`](crate::dispatch::Dispatcher::run).

use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the muxloop core.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation is not ready now; retry on the next readiness event.
    #[error("operation would block")]
    WouldBlock,

    /// End-of-stream was observed on a descriptor.
    #[error("peer closed the connection")]
    PeerClosed,

    /// An OS-level failure on one specific descriptor.
    #[error("descriptor {fd} failed: {source}")]
    Descriptor {
        /// The failing descriptor.
        fd: RawFd,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The process or system ran out of a resource (descriptors, memory).
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(#[source] io::Error),

    /// The readiness primitive itself failed. Terminates the dispatcher.
    #[error("multiplexer failure: {0}")]
    FatalMultiplexer(#[source] io::Error),

    /// Configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The dispatcher behind a handle is gone.
    #[error("dispatcher is no longer running")]
    Disconnected,

    /// Setup failure (bind, listen, connect, socket creation).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse classification of an I/O error observed on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Not ready now.
    WouldBlock,
    /// Interrupted by a signal; the call should be retried in place.
    Interrupted,
    /// Out of descriptors, buffers or memory.
    ResourceExhaustion,
    /// Anything else: the descriptor is unusable.
    Descriptor,
}

impl ErrorClass {
    /// Classify an I/O error.
    pub fn of(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => return Self::WouldBlock,
            io::ErrorKind::Interrupted => return Self::Interrupted,
            _ => {}
        }

        match err.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS)
            | Some(libc::ENOMEM) => Self::ResourceExhaustion,
            _ => Self::Descriptor,
        }
    }
}

impl Error {
    /// Wrap an I/O error observed on `fd` into the matching taxonomy variant.
    pub fn on_descriptor(fd: RawFd, err: io::Error) -> Self {
        match ErrorClass::of(&err) {
            ErrorClass::WouldBlock => Self::WouldBlock,
            ErrorClass::ResourceExhaustion => Self::ResourceExhaustion(err),
            ErrorClass::Interrupted | ErrorClass::Descriptor => Self::Descriptor { fd, source: err },
        }
    }

    /// Returns true if this error only means "try again later".
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}
