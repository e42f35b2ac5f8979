//! Network endpoints driven by the dispatcher.
//!
//! This module provides the [`Connection`] state machine, the [`Acceptor`]
//! for listening sockets, and socket construction helpers.

mod acceptor;
mod connection;
pub mod socket;

pub use acceptor::{AcceptBatch, Acceptor};
pub use connection::{CloseReason, ConnId, ConnState, Connection};

pub(crate) use connection::{ReadOutcome, WriteOutcome};
