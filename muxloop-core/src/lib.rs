//! Muxloop Core - readiness-driven connection multiplexing
//!
//! A single thread drives many non-blocking TCP connections: a
//! [`Multiplexer`](poll::Multiplexer) reports which descriptors are ready,
//! and a [`Dispatcher`](dispatch::Dispatcher) turns readiness into
//! callbacks on an application [`Handler`](dispatch::Handler).
//!
//! ```no_run
//! use muxloop_core::config::ServerConfig;
//! use muxloop_core::dispatch::{Ctx, Dispatcher, Handler};
//! use muxloop_core::net::Connection;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     type Context = ();
//!
//!     fn on_data(&mut self, conn: &mut Connection<()>, data: &[u8], _ctx: &mut Ctx<'_, ()>) -> usize {
//!         conn.send(data);
//!         data.len()
//!     }
//! }
//!
//! let mut dispatcher = Dispatcher::new(ServerConfig::default(), Echo)?;
//! dispatcher.bind()?;
//! dispatcher.run()?;
//! # Ok::<(), muxloop_core::Error>(())
//! ```

/// Thread layout and partitioned scaling
pub mod arch;

/// Byte buffers and outbound queues
pub mod buffer;

/// Configuration loading
pub mod config;

/// The event loop
pub mod dispatch;

pub mod error;

/// Structured logging setup
pub mod logging;

/// Connections, listeners and socket helpers
pub mod net;

/// Readiness multiplexing
pub mod poll;

pub use error::{Error, ErrorClass, Result};
