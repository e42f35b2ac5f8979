//! Listening socket that admits new connections.

use super::socket;
use crate::error::ErrorClass;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// Outcome of one [`Acceptor::accept_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptBatch {
    /// Connections pushed to the output vector.
    pub accepted: usize,

    /// The batch ended on descriptor or memory exhaustion. The pending
    /// connection is still queued and the listener stays ready.
    pub exhausted: bool,
}

/// A non-blocking listener registered for accept readiness.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Binds a new listener with the given accept-queue backlog.
    pub fn bind(addr: SocketAddr, backlog: u32, reuse_port: bool) -> io::Result<Self> {
        let listener = socket::bind_listener(addr, backlog, reuse_port)?;
        Self::from_listener(listener)
    }

    /// Wraps an already bound and listening socket.
    pub fn from_listener(listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts up to `cap` pending connections.
    ///
    /// Stops early when the queue is empty. Failures are logged and end
    /// the batch without affecting the listener; connections still queued
    /// are picked up on the next readiness event.
    pub fn accept_batch(
        &self,
        cap: usize,
        nodelay: bool,
        accepted: &mut Vec<(TcpStream, SocketAddr)>,
    ) -> AcceptBatch {
        let mut batch = AcceptBatch::default();

        while batch.accepted < cap {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = socket::configure_accepted(&stream, nodelay) {
                        warn!(%peer, %err, "failed to configure accepted connection");
                        continue;
                    }
                    accepted.push((stream, peer));
                    batch.accepted += 1;
                }
                Err(err) => match ErrorClass::of(&err) {
                    ErrorClass::WouldBlock => break,
                    ErrorClass::Interrupted => continue,
                    ErrorClass::ResourceExhaustion => {
                        warn!(listener = %self.local_addr, %err, "accept failed: resources exhausted");
                        batch.exhausted = true;
                        break;
                    }
                    ErrorClass::Descriptor => {
                        // ECONNABORTED and friends concern only that one
                        // pending connection.
                        if err.kind() == io::ErrorKind::ConnectionAborted {
                            debug!(listener = %self.local_addr, %err, "pending connection aborted");
                            continue;
                        }
                        warn!(listener = %self.local_addr, %err, "accept failed");
                        break;
                    }
                },
            }
        }

        batch
    }
}
