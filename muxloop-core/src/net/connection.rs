//! A single TCP connection owned by the dispatcher.

use crate::buffer::{Buffer, Fill, OutboundQueue};
use crate::poll::{Interest, Token};
use std::fmt;
use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use thiserror::Error;

/// Identity of a connection within one dispatcher.
///
/// Identifiers are never reused, so a stale id cannot address a newer
/// connection that happens to get the same descriptor number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) usize);

impl ConnId {
    /// The multiplexer token of this connection.
    pub fn token(self) -> Token {
        Token(self.0)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl From<Token> for ConnId {
    fn from(token: Token) -> Self {
        ConnId(token.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// A non-blocking connect is in flight.
    Connecting,
    /// Established; reading and writing.
    Open,
    /// Graceful close requested; draining the outbound queue.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a connection was closed. Handed to `on_close`.
#[derive(Debug, Error)]
pub enum CloseReason {
    /// End-of-stream was read from the peer.
    #[error("peer closed the connection")]
    PeerClosed,

    /// A graceful close finished draining the outbound queue.
    #[error("closed locally")]
    Local,

    /// Closed immediately at the application's request; unsent data was dropped.
    #[error("aborted locally")]
    Aborted,

    /// An unrecoverable I/O error on the descriptor.
    #[error("descriptor error: {0}")]
    Error(#[source] io::Error),

    /// A non-blocking connect failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    /// Still open when the shutdown grace period ran out.
    #[error("dispatcher shut down")]
    Shutdown,
}

/// Result of servicing read readiness.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// New bytes are in the inbound buffer.
    Data(usize),
    /// Spurious wake-up; nothing to read now.
    Pending,
    /// The inbound buffer has no room left.
    Full,
    /// The peer closed its side.
    EndOfStream,
    Failed(io::Error),
}

/// Result of servicing write readiness.
#[derive(Debug)]
pub(crate) enum WriteOutcome {
    /// Some or no bytes were written; the queue is not empty yet.
    Progress(usize),
    /// The outbound queue is now empty.
    Drained(usize),
    Failed(io::Error),
}

/// One connection: a non-blocking stream plus its buffers and state.
///
/// `C` is the application context attached to the connection. The core
/// stores it and never looks inside.
pub struct Connection<C> {
    id: ConnId,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    state: ConnState,

    /// Bytes read from the peer, not yet consumed by the application.
    inbound: Buffer,

    /// Inbound capacity requested by the application, applied after the
    /// current callback returns.
    inbound_request: Option<usize>,

    /// Bytes waiting to be written to the peer.
    outbound: OutboundQueue,

    /// Interest currently registered with the multiplexer.
    registered: Interest,

    /// End-of-stream was read while output was still queued.
    peer_closed: bool,

    context: Option<C>,
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.stream.as_raw_fd())
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("registered", &self.registered)
            .finish()
    }
}

impl<C> Connection<C> {
    pub(crate) fn new(
        id: ConnId,
        stream: TcpStream,
        peer: Option<SocketAddr>,
        state: ConnState,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            id,
            stream,
            peer,
            state,
            inbound: Buffer::new(buffer_capacity),
            inbound_request: None,
            outbound: OutboundQueue::new(buffer_capacity),
            registered: Interest::NONE,
            peer_closed: false,
            context: None,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    /// Queues a copy of `bytes` for sending. Ignored unless the connection is
    /// open or connecting.
    pub fn send(&mut self, bytes: &[u8]) {
        if self.accepts_output() {
            self.outbound.push(bytes);
        }
    }

    /// Queues an owned vector for sending without copying it.
    pub fn send_vec(&mut self, bytes: Vec<u8>) {
        if self.accepts_output() {
            self.outbound.push_vec(bytes);
        }
    }

    /// Queues the contents of `file` as a memory-mapped segment.
    pub fn send_file(&mut self, file: &File) -> io::Result<usize> {
        if !self.accepts_output() {
            return Ok(0);
        }
        self.outbound.push_file(file)
    }

    /// Bytes queued but not yet written.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Requests a graceful close: queued bytes are flushed first, nothing
    /// more is read.
    pub fn close(&mut self) {
        match self.state {
            ConnState::Open => self.state = ConnState::Closing,
            ConnState::Connecting => self.state = ConnState::Closed,
            ConnState::Closing | ConnState::Closed => {}
        }
    }

    /// Current inbound buffer capacity.
    pub fn inbound_capacity(&self) -> usize {
        self.inbound_request.unwrap_or(self.inbound.capacity())
    }

    /// Asks for a larger inbound buffer; unread bytes are kept.
    pub fn reserve_inbound(&mut self, capacity: usize) {
        if capacity > self.inbound_capacity() {
            self.inbound_request = Some(capacity);
        }
    }

    /// Unread inbound bytes.
    pub fn inbound_len(&self) -> usize {
        self.inbound.readable()
    }

    /// Attaches application context, replacing any previous one.
    pub fn attach(&mut self, context: C) {
        self.context = Some(context);
    }

    pub fn attachment(&self) -> Option<&C> {
        self.context.as_ref()
    }

    pub fn attachment_mut(&mut self) -> Option<&mut C> {
        self.context.as_mut()
    }

    pub fn take_attachment(&mut self) -> Option<C> {
        self.context.take()
    }

    /// Interest currently registered with the multiplexer.
    pub fn registered_interest(&self) -> Interest {
        self.registered
    }

    fn accepts_output(&self) -> bool {
        matches!(self.state, ConnState::Open | ConnState::Connecting)
    }

    /// True when the inbound buffer cannot take more bytes even after compaction.
    fn inbound_saturated(&self) -> bool {
        self.inbound.readable() >= self.inbound.limit()
    }

    /// The interest this connection should be registered with.
    ///
    /// Writable is only requested while there is something to flush, except
    /// while connecting, where writability signals connect completion.
    pub(crate) fn desired_interest(&self) -> Interest {
        match self.state {
            ConnState::Connecting => Interest::WRITABLE,
            ConnState::Open => {
                let mut interest = Interest::NONE;
                if !self.inbound_saturated() {
                    interest = interest | Interest::READABLE;
                }
                if !self.outbound.is_empty() {
                    interest = interest | Interest::WRITABLE;
                }
                interest
            }
            ConnState::Closing if !self.outbound.is_empty() => Interest::WRITABLE,
            ConnState::Closing | ConnState::Closed => Interest::NONE,
        }
    }

    pub(crate) fn set_registered(&mut self, interest: Interest) {
        self.registered = interest;
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub(crate) fn set_peer(&mut self, peer: Option<SocketAddr>) {
        self.peer = peer;
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// True once a graceful close has nothing left to flush.
    pub(crate) fn close_complete(&self) -> bool {
        self.state == ConnState::Closing && self.outbound.is_empty()
    }

    /// The peer finished sending. Stops reading and keeps the connection
    /// until queued output is flushed.
    pub(crate) fn finish_input(&mut self) {
        self.peer_closed = true;
        if self.state == ConnState::Open {
            self.state = ConnState::Closing;
        }
    }

    /// Reason reported when a graceful close completes.
    pub(crate) fn drained_reason(&self) -> CloseReason {
        if self.peer_closed {
            CloseReason::PeerClosed
        } else {
            CloseReason::Local
        }
    }

    /// Reads once from the stream into the inbound buffer.
    pub(crate) fn read_ready(&mut self) -> ReadOutcome {
        if self.inbound.remaining() == 0 {
            self.inbound.compact();
        }

        match self.inbound.fill_from(&mut self.stream) {
            Ok(Fill::Read(n)) => ReadOutcome::Data(n),
            Ok(Fill::Pending) => ReadOutcome::Pending,
            Ok(Fill::Full) => ReadOutcome::Full,
            Ok(Fill::EndOfStream) => ReadOutcome::EndOfStream,
            Err(e) => ReadOutcome::Failed(e),
        }
    }

    /// Flushes the outbound queue as far as the socket allows.
    pub(crate) fn write_ready(&mut self) -> WriteOutcome {
        match self.outbound.flush_into(&mut self.stream) {
            Ok(n) if self.outbound.is_empty() => WriteOutcome::Drained(n),
            Ok(n) => WriteOutcome::Progress(n),
            Err(e) => WriteOutcome::Failed(e),
        }
    }

    /// Moves the inbound buffer out for the duration of an `on_data` call.
    pub(crate) fn take_inbound(&mut self) -> Buffer {
        std::mem::take(&mut self.inbound)
    }

    /// Puts the inbound buffer back, consuming `consumed` bytes and applying
    /// any pending capacity request.
    pub(crate) fn restore_inbound(&mut self, mut inbound: Buffer, consumed: usize) {
        inbound.consume(consumed.min(inbound.readable()));
        if let Some(capacity) = self.inbound_request.take() {
            inbound.grow(capacity);
        }
        self.inbound = inbound;
    }

    /// Terminal transition. Unread inbound bytes and unsent outbound bytes
    /// are discarded.
    pub(crate) fn mark_closed(&mut self) {
        self.state = ConnState::Closed;
        self.inbound.reset();
        self.outbound.clear();
    }
}
