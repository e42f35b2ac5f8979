//! The event loop.

use super::handle::{Command, DispatcherHandle, Mailbox};
use super::handler::Handler;
use super::table::{Ctx, Table};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::net::{
    socket, Acceptor, CloseReason, ConnId, ConnState, Connection, ReadOutcome, WriteOutcome,
};
use crate::poll::{Event, Interest, Multiplexer, PollMultiplexer, Ready, Token};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Reserved for the cross-thread wake socket.
const WAKE_TOKEN: Token = Token(0);

/// Drives connections and listeners from a single thread.
///
/// Each cycle waits on the multiplexer, then handles the whole batch in
/// three passes: accepts, then reads (including error and hang-up reports),
/// then writes (including connect completion). Interest changes made while
/// handling the batch are applied before the next wait.
pub struct Dispatcher<H: Handler, M: Multiplexer = PollMultiplexer> {
    config: ServerConfig,
    handler: H,
    mux: M,
    table: Table<H::Context>,
    acceptors: HashMap<Token, Acceptor>,

    /// Listeners parked after descriptor exhaustion, with their resume time.
    paused: HashMap<Token, Instant>,

    mailbox: Mailbox,
    events: Vec<Event>,
    accepted: Vec<(TcpStream, SocketAddr)>,

    /// Set once shutdown has begun; connections still open at this instant
    /// are force-closed.
    shutdown_deadline: Option<Instant>,
}

impl<H: Handler> Dispatcher<H> {
    /// Creates a dispatcher on the default `poll(2)` backend.
    pub fn new(config: ServerConfig, handler: H) -> Result<Self> {
        Self::with_multiplexer(config, handler, PollMultiplexer::new())
    }
}

impl<H: Handler, M: Multiplexer> Dispatcher<H, M> {
    /// Creates a dispatcher on a caller-supplied readiness backend.
    pub fn with_multiplexer(config: ServerConfig, handler: H, mut mux: M) -> Result<Self> {
        config.validate()?;

        let mailbox = Mailbox::new()?;
        mux.register(mailbox.wake_rx.as_raw_fd(), Interest::READABLE, WAKE_TOKEN)
            .map_err(Error::FatalMultiplexer)?;

        Ok(Self {
            table: Table::new(WAKE_TOKEN.0 + 1, config.buffer_capacity, config.nodelay),
            events: Vec::with_capacity(config.event_capacity),
            accepted: Vec::with_capacity(config.accept_batch),
            config,
            handler,
            mux,
            acceptors: HashMap::new(),
            paused: HashMap::new(),
            mailbox,
            shutdown_deadline: None,
        })
    }

    /// Binds a listener on `addr` and returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let acceptor = Acceptor::bind(addr, self.config.backlog, self.config.reuse_port)?;
        self.add_acceptor(acceptor)
    }

    /// Binds a listener on the configured address.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        self.listen(self.config.socket_addr())
    }

    /// Takes over an already listening socket.
    pub fn add_listener(&mut self, listener: TcpListener) -> Result<SocketAddr> {
        let acceptor = Acceptor::from_listener(listener)?;
        self.add_acceptor(acceptor)
    }

    fn add_acceptor(&mut self, acceptor: Acceptor) -> Result<SocketAddr> {
        let token = self.table.alloc_id().token();
        let addr = acceptor.local_addr();
        self.mux
            .register(acceptor.fd(), Interest::ACCEPTABLE, token)
            .map_err(|e| Error::on_descriptor(acceptor.fd(), e))?;
        info!(%addr, token = token.0, backlog = self.config.backlog, "listening");
        self.acceptors.insert(token, acceptor);
        Ok(addr)
    }

    /// Starts a non-blocking connect. `on_connect` runs once it completes.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<ConnId> {
        let id = self.table.connect(addr)?;
        self.reconcile_interest();
        Ok(id)
    }

    /// Adopts an already connected stream as an open connection.
    pub fn adopt(&mut self, stream: TcpStream) -> Result<ConnId> {
        socket::configure_accepted(&stream, self.config.nodelay)?;
        let peer = stream.peer_addr().ok();
        let id = self.table.alloc_id();
        self.open(id, stream, peer);
        self.reconcile_interest();
        Ok(id)
    }

    /// A handle for other threads.
    pub fn handle(&self) -> DispatcherHandle {
        self.mailbox.handle()
    }

    pub fn connection_count(&self) -> usize {
        self.table.connections.len()
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection<H::Context>> {
        self.table.connections.get(&id)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self.acceptors.values().map(Acceptor::local_addr).collect();
        addrs.sort();
        addrs
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    /// Runs until stopped and every connection is closed.
    ///
    /// Only a multiplexer failure ends the loop with an error; failures on
    /// individual connections close those connections.
    pub fn run(&mut self) -> Result<()> {
        info!(listeners = self.acceptors.len(), "dispatcher running");
        while self.run_once()? {}
        info!("dispatcher stopped");
        Ok(())
    }

    /// Runs one wait-and-dispatch cycle. Returns false once shutdown has
    /// completed.
    pub fn run_once(&mut self) -> Result<bool> {
        if self.shutdown_deadline.is_none()
            && (self.table.stop_requested || self.mailbox.shared.stop_requested())
        {
            self.begin_shutdown();
        }

        let mut timeout = self.config.poll_timeout();
        if let Some(resume) = self.resume_listeners() {
            timeout = timeout.min(resume);
        }
        if let Some(deadline) = self.shutdown_deadline {
            if self.table.connections.is_empty() {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                self.force_close_all();
                return Ok(false);
            }
            timeout = timeout.min(deadline - now);
        }

        self.wait(timeout)?;
        self.dispatch_batch();
        self.reconcile_interest();
        Ok(true)
    }

    fn wait(&mut self, timeout: Duration) -> Result<()> {
        self.mux.wait(&mut self.events, Some(timeout)).map_err(|e| {
            error!(error = %e, "multiplexer wait failed");
            Error::FatalMultiplexer(e)
        })?;
        if !self.events.is_empty() {
            debug!(events = self.events.len(), "dispatching batch");
        }
        Ok(())
    }

    fn dispatch_batch(&mut self) {
        let events = std::mem::take(&mut self.events);

        for event in &events {
            if event.token == WAKE_TOKEN {
                self.process_commands();
            } else if self.acceptors.contains_key(&event.token) {
                self.accept_ready(event.token, event.ready);
            }
        }

        for event in &events {
            let ready = event.ready;
            if ready.is_readable() || ready.is_error() || ready.is_hangup() {
                self.read_ready(ConnId::from(event.token), ready);
            }
        }

        for event in &events {
            let ready = event.ready;
            if ready.is_writable() || ready.is_error() || ready.is_hangup() {
                self.write_ready(ConnId::from(event.token), ready);
            }
        }

        self.events = events;
    }

    fn process_commands(&mut self) {
        self.mailbox.drain_wake();

        while let Ok(command) = self.mailbox.commands.try_recv() {
            match command {
                Command::Send(id, bytes) => {
                    if !self.table.send_vec(id, bytes) {
                        debug!(conn = %id, "dropping send for unknown connection");
                    }
                }
                Command::Close(id) => {
                    if !self.table.close(id) {
                        debug!(conn = %id, "dropping close for unknown connection");
                    }
                }
                Command::Stop => self.table.stop_requested = true,
            }
        }
        self.finish_closed();
    }

    fn accept_ready(&mut self, token: Token, ready: Ready) {
        let Some(acceptor) = self.acceptors.get(&token) else {
            return;
        };
        if ready.is_error() {
            warn!(listener = %acceptor.local_addr(), "listener reported an error");
        }

        let mut accepted = std::mem::take(&mut self.accepted);
        let batch = acceptor.accept_batch(self.config.accept_batch, self.config.nodelay, &mut accepted);
        trace!(listener = %acceptor.local_addr(), count = batch.accepted, "accepted batch");
        if batch.exhausted {
            self.pause_listener(token);
        }

        for (stream, peer) in accepted.drain(..) {
            let id = self.table.alloc_id();
            self.open(id, stream, Some(peer));
        }
        self.accepted = accepted;
    }

    /// Stops polling a listener for accepts until the backoff elapses. The
    /// pending connection stays queued in the kernel meanwhile.
    fn pause_listener(&mut self, token: Token) {
        let Some(acceptor) = self.acceptors.get(&token) else {
            return;
        };
        let backoff = self.config.accept_backoff();
        match self.mux.register(acceptor.fd(), Interest::NONE, token) {
            Ok(()) => {
                debug!(listener = %acceptor.local_addr(), backoff_ms = backoff.as_millis() as u64, "pausing accepts");
                self.paused.insert(token, Instant::now() + backoff);
            }
            Err(err) => warn!(listener = %acceptor.local_addr(), error = %err, "pause failed"),
        }
    }

    /// Re-arms paused listeners whose backoff has elapsed. Returns the time
    /// until the next one is due, if any remain paused.
    fn resume_listeners(&mut self) -> Option<Duration> {
        if self.paused.is_empty() {
            return None;
        }

        let now = Instant::now();
        let due: Vec<Token> = self
            .paused
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(&token, _)| token)
            .collect();

        for token in due {
            self.paused.remove(&token);
            let Some(acceptor) = self.acceptors.get(&token) else {
                continue;
            };
            match self.mux.register(acceptor.fd(), Interest::ACCEPTABLE, token) {
                Ok(()) => debug!(listener = %acceptor.local_addr(), "resuming accepts"),
                Err(err) => warn!(listener = %acceptor.local_addr(), error = %err, "resume failed"),
            }
        }

        self.paused.values().min().map(|&at| at.saturating_duration_since(now))
    }

    /// Inserts a new open connection and runs `on_connect`.
    fn open(&mut self, id: ConnId, stream: TcpStream, peer: Option<SocketAddr>) {
        let mut conn = Connection::new(
            id,
            stream,
            peer,
            ConnState::Open,
            self.table.buffer_capacity(),
        );
        info!(conn = %id, fd = conn.fd(), peer = ?peer, "connection opened");

        let mut ctx = Ctx::new(&mut self.table, Some(id));
        self.handler.on_connect(&mut conn, &mut ctx);
        self.settle(conn);
    }

    fn read_ready(&mut self, id: ConnId, ready: Ready) {
        // Gone already: closed earlier in this batch, or not a connection.
        let Some(mut conn) = self.table.connections.remove(&id) else {
            return;
        };

        if conn.state() != ConnState::Open {
            self.table.connections.insert(id, conn);
            return;
        }

        match conn.read_ready() {
            ReadOutcome::Data(n) => {
                trace!(conn = %id, bytes = n, "read");
                self.deliver(conn);
            }
            ReadOutcome::Pending => {
                if ready.is_error() {
                    match conn.stream().take_error() {
                        Ok(Some(err)) | Err(err) => {
                            self.close_with(conn, CloseReason::Error(err));
                            return;
                        }
                        Ok(None) => {}
                    }
                }
                self.table.connections.insert(id, conn);
            }
            // Parked with a full buffer; only hang-up and errors are polled.
            ReadOutcome::Full if ready.is_error() || ready.is_hangup() => {
                let reason = match conn.stream().take_error() {
                    Ok(Some(err)) => CloseReason::Error(err),
                    _ => CloseReason::PeerClosed,
                };
                debug!(conn = %id, unread = conn.inbound_len(), "parked connection hung up");
                self.close_with(conn, reason);
            }
            // Reading stays paused until the handler makes room.
            ReadOutcome::Full => self.table.insert(conn),
            ReadOutcome::EndOfStream if conn.pending_outbound() > 0 => {
                debug!(conn = %id, pending = conn.pending_outbound(), "peer finished sending, draining output");
                conn.finish_input();
                self.table.insert(conn);
            }
            ReadOutcome::EndOfStream => self.close_with(conn, CloseReason::PeerClosed),
            ReadOutcome::Failed(err) => self.close_with(conn, CloseReason::Error(err)),
        }
    }

    fn deliver(&mut self, mut conn: Connection<H::Context>) {
        let id = conn.id();
        let inbound = conn.take_inbound();

        let mut ctx = Ctx::new(&mut self.table, Some(id));
        let consumed = self.handler.on_data(&mut conn, inbound.as_slice(), &mut ctx);
        trace!(conn = %id, consumed, unread = inbound.readable(), "delivered");

        conn.restore_inbound(inbound, consumed);
        self.settle(conn);
    }

    fn write_ready(&mut self, id: ConnId, ready: Ready) {
        let Some(mut conn) = self.table.connections.remove(&id) else {
            return;
        };

        match conn.state() {
            ConnState::Connecting => self.finish_connect(conn),
            ConnState::Open | ConnState::Closing if ready.is_writable() => match conn.write_ready() {
                WriteOutcome::Progress(n) => {
                    trace!(conn = %id, bytes = n, pending = conn.pending_outbound(), "partial write");
                    self.table.insert(conn);
                }
                WriteOutcome::Drained(n) => {
                    trace!(conn = %id, bytes = n, "outbound drained");
                    if conn.state() == ConnState::Open {
                        let mut ctx = Ctx::new(&mut self.table, Some(id));
                        self.handler.on_writable(&mut conn, &mut ctx);
                    }
                    self.settle(conn);
                }
                WriteOutcome::Failed(err) => self.close_with(conn, CloseReason::Error(err)),
            },
            // A draining connection is not read, so errors surface here.
            ConnState::Closing if ready.is_error() || ready.is_hangup() => {
                let err = match conn.stream().take_error() {
                    Ok(Some(err)) | Err(err) => err,
                    Ok(None) => io::Error::from(io::ErrorKind::ConnectionReset),
                };
                self.close_with(conn, CloseReason::Error(err));
            }
            _ => {
                self.table.connections.insert(id, conn);
            }
        }
    }

    fn finish_connect(&mut self, mut conn: Connection<H::Context>) {
        let id = conn.id();
        match socket::finish_connect(conn.stream()) {
            Ok(()) => {
                conn.set_state(ConnState::Open);
                conn.set_peer(conn.stream().peer_addr().ok().or(conn.peer_addr()));
                info!(conn = %id, fd = conn.fd(), peer = ?conn.peer_addr(), "connection established");

                let mut ctx = Ctx::new(&mut self.table, Some(id));
                self.handler.on_connect(&mut conn, &mut ctx);
                self.settle(conn);
            }
            Err(err) => {
                debug!(conn = %id, error = %err, "connect failed");
                self.close_with(conn, CloseReason::ConnectFailed(err));
            }
        }
    }

    /// Puts a connection back after a callback, or retires it if the
    /// callback closed it.
    fn settle(&mut self, conn: Connection<H::Context>) {
        if conn.state() == ConnState::Closed || conn.close_complete() {
            let reason = conn.drained_reason();
            self.table.retire(conn, reason);
        } else {
            self.table.insert(conn);
        }
        self.finish_closed();
    }

    fn close_with(&mut self, conn: Connection<H::Context>, reason: CloseReason) {
        self.table.retire(conn, reason);
        self.finish_closed();
    }

    /// Deregisters retired connections and runs `on_close` for each.
    /// Closes requested from `on_close` are processed in the same call.
    fn finish_closed(&mut self) {
        while let Some((mut conn, reason)) = self.table.closed.pop_front() {
            let id = conn.id();
            if let Err(err) = self.mux.deregister(conn.fd()) {
                warn!(conn = %id, fd = conn.fd(), error = %err, "deregister failed");
            }
            info!(conn = %id, peer = ?conn.peer_addr(), %reason, "connection closed");

            let mut ctx = Ctx::new(&mut self.table, None);
            self.handler.on_close(&mut conn, &reason, &mut ctx);
        }
    }

    /// Applies pending interest changes to the multiplexer.
    ///
    /// Repeats until nothing is dirty, since `on_close` callbacks run here
    /// may queue output on other connections.
    fn reconcile_interest(&mut self) {
        while !self.table.dirty.is_empty() {
            let mut dirty = std::mem::take(&mut self.table.dirty);
            dirty.sort_unstable();
            dirty.dedup();
            self.apply_interest(&dirty);
            self.finish_closed();
        }
    }

    fn apply_interest(&mut self, dirty: &[ConnId]) {
        for &id in dirty {
            let Some(conn) = self.table.connections.get_mut(&id) else {
                continue;
            };
            let desired = conn.desired_interest();
            if desired == conn.registered_interest() {
                continue;
            }

            match self.mux.register(conn.fd(), desired, id.token()) {
                Ok(()) => {
                    debug!(conn = %id, from = ?conn.registered_interest(), to = ?desired, "interest changed");
                    conn.set_registered(desired);
                }
                Err(err) => {
                    warn!(conn = %id, fd = conn.fd(), error = %err, "register failed");
                    self.table.abort(id, CloseReason::Error(err));
                }
            }
        }
    }

    fn begin_shutdown(&mut self) {
        let grace = self.config.shutdown_grace();
        info!(
            connections = self.table.connections.len(),
            grace_ms = grace.as_millis() as u64,
            "shutting down"
        );

        self.paused.clear();
        for (_, acceptor) in self.acceptors.drain() {
            if let Err(err) = self.mux.deregister(acceptor.fd()) {
                warn!(listener = %acceptor.local_addr(), error = %err, "deregister failed");
            }
        }

        let mut ids: Vec<ConnId> = self.table.connections.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.table.close(id);
        }
        self.finish_closed();
        self.reconcile_interest();

        self.shutdown_deadline = Some(Instant::now() + grace);
    }

    fn force_close_all(&mut self) {
        let mut ids: Vec<ConnId> = self.table.connections.keys().copied().collect();
        ids.sort_unstable();
        if !ids.is_empty() {
            warn!(connections = ids.len(), "grace period expired, closing remaining connections");
        }
        for id in ids {
            self.table.abort(id, CloseReason::Shutdown);
        }
        self.finish_closed();
    }
}
