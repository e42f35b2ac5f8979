//! The dispatcher's connection table and the callback context built on it.

use crate::error::Result;
use crate::net::{socket, CloseReason, ConnId, ConnState, Connection};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use tracing::debug;

/// Connections owned by one dispatcher, plus work deferred to the end of
/// the current callback (closes) or batch (interest changes).
pub(crate) struct Table<C> {
    pub(crate) connections: HashMap<ConnId, Connection<C>>,

    /// Connections whose interest may have changed since the last reconcile.
    pub(crate) dirty: Vec<ConnId>,

    /// Connections removed from the table, waiting for deregistration and `on_close`.
    pub(crate) closed: VecDeque<(Connection<C>, CloseReason)>,

    pub(crate) stop_requested: bool,

    next_id: usize,
    buffer_capacity: usize,
    nodelay: bool,
}

impl<C> Table<C> {
    /// Ids start at `first_id`; lower values are reserved tokens.
    pub(crate) fn new(first_id: usize, buffer_capacity: usize, nodelay: bool) -> Self {
        Self {
            connections: HashMap::new(),
            dirty: Vec::new(),
            closed: VecDeque::new(),
            stop_requested: false,
            next_id: first_id,
            buffer_capacity,
            nodelay,
        }
    }

    pub(crate) fn alloc_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub(crate) fn insert(&mut self, conn: Connection<C>) {
        let id = conn.id();
        self.connections.insert(id, conn);
        self.dirty.push(id);
    }

    /// Terminal transition for a connection that is no longer in the table.
    pub(crate) fn retire(&mut self, mut conn: Connection<C>, reason: CloseReason) {
        conn.mark_closed();
        self.closed.push_back((conn, reason));
    }

    /// Removes `id` from the table immediately.
    pub(crate) fn abort(&mut self, id: ConnId, reason: CloseReason) -> bool {
        match self.connections.remove(&id) {
            Some(conn) => {
                self.retire(conn, reason);
                true
            }
            None => false,
        }
    }

    /// Starts a graceful close; finishes it at once if nothing is queued.
    pub(crate) fn close(&mut self, id: ConnId) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };

        conn.close();
        if conn.state() == ConnState::Closed || conn.close_complete() {
            let reason = conn.drained_reason();
            self.abort(id, reason);
        } else {
            self.dirty.push(id);
        }
        true
    }

    pub(crate) fn send(&mut self, id: ConnId, bytes: &[u8]) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.send(bytes);
                self.dirty.push(id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn send_vec(&mut self, id: ConnId, bytes: Vec<u8>) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.send_vec(bytes);
                self.dirty.push(id);
                true
            }
            None => false,
        }
    }

    /// Starts a client connection. It is registered at the next reconcile.
    pub(crate) fn connect(&mut self, addr: SocketAddr) -> Result<ConnId> {
        let (stream, _) = socket::connect_nonblocking(addr, self.nodelay)?;
        let id = self.alloc_id();
        debug!(conn = %id, %addr, "connecting");
        self.insert(Connection::new(
            id,
            stream,
            Some(addr),
            ConnState::Connecting,
            self.buffer_capacity,
        ));
        Ok(id)
    }
}

/// Access to the dispatcher from inside a [`Handler`](super::Handler) callback.
///
/// The connection the callback is running for is handed to the callback
/// directly and is not reachable through `Ctx`; every other connection is.
/// Closing another connection takes effect immediately: it receives no
/// further callbacks for events still pending in the current batch.
pub struct Ctx<'a, C> {
    table: &'a mut Table<C>,
    current: Option<ConnId>,
}

impl<'a, C> Ctx<'a, C> {
    pub(crate) fn new(table: &'a mut Table<C>, current: Option<ConnId>) -> Self {
        Self { table, current }
    }

    /// The connection the running callback belongs to.
    pub fn current(&self) -> Option<ConnId> {
        self.current
    }

    /// Queues bytes on another connection. Returns false if it does not exist.
    pub fn send(&mut self, id: ConnId, bytes: &[u8]) -> bool {
        self.table.send(id, bytes)
    }

    /// Queues an owned vector on another connection.
    pub fn send_vec(&mut self, id: ConnId, bytes: Vec<u8>) -> bool {
        self.table.send_vec(id, bytes)
    }

    /// Gracefully closes another connection.
    pub fn close(&mut self, id: ConnId) -> bool {
        self.table.close(id)
    }

    /// Closes another connection immediately, dropping unsent data.
    pub fn abort(&mut self, id: ConnId) -> bool {
        self.table.abort(id, CloseReason::Aborted)
    }

    /// Ids of all connections in the table, excluding the current one.
    pub fn connection_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.table.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.table.connections.len()
    }

    /// Starts a client connection from inside a callback.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<ConnId> {
        self.table.connect(addr)
    }

    /// Asks the dispatcher to shut down after the current cycle.
    pub fn stop(&mut self) {
        self.table.stop_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn table_with(n: usize) -> (Table<()>, Vec<ConnId>, Vec<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = Table::new(1, 64, false);
        let mut ids = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..n {
            peers.push(TcpStream::connect(listener.local_addr().unwrap()).unwrap());
            let (stream, peer) = listener.accept().unwrap();
            stream.set_nonblocking(true).unwrap();
            let id = table.alloc_id();
            table.insert(Connection::new(id, stream, Some(peer), ConnState::Open, 64));
            ids.push(id);
        }
        (table, ids, peers)
    }

    #[test]
    fn test_ids_are_never_reused() {
        let (mut table, ids, _peers) = table_with(2);
        assert!(table.abort(ids[0], CloseReason::Aborted));
        let next = table.alloc_id();
        assert!(ids.iter().all(|&id| id != next));
    }

    #[test]
    fn test_close_without_pending_output_is_immediate() {
        let (mut table, ids, _peers) = table_with(1);
        assert!(table.close(ids[0]));
        assert!(table.connections.is_empty());

        let (conn, reason) = table.closed.pop_front().unwrap();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(matches!(reason, CloseReason::Local));
    }

    #[test]
    fn test_close_with_pending_output_waits() {
        let (mut table, ids, _peers) = table_with(1);
        assert!(table.send(ids[0], b"flush me"));
        assert!(table.close(ids[0]));
        assert_eq!(table.connections[&ids[0]].state(), ConnState::Closing);
        assert!(table.closed.is_empty());
    }

    #[test]
    fn test_ctx_excludes_current_connection() {
        let (mut table, ids, _peers) = table_with(3);
        let current = table.connections.remove(&ids[1]).unwrap();

        let mut ctx = Ctx::new(&mut table, Some(current.id()));
        assert_eq!(ctx.connection_ids(), vec![ids[0], ids[2]]);
        assert!(!ctx.send(ids[1], b"self"));
        assert!(ctx.send(ids[2], b"other"));
        assert!(ctx.abort(ids[0]));
        assert_eq!(ctx.connection_count(), 1);

        ctx.stop();
        assert!(table.stop_requested);
        assert_eq!(table.connections[&ids[2]].pending_outbound(), 5);
    }

    #[test]
    fn test_sends_to_missing_connection_are_rejected() {
        let (mut table, _ids, _peers) = table_with(0);
        assert!(!table.send(ConnId(42), b"nobody"));
        assert!(!table.close(ConnId(42)));
        assert!(!table.abort(ConnId(42), CloseReason::Aborted));
    }
}
