//! Single-threaded readiness dispatch.
//!
//! A [`Dispatcher`] owns one multiplexer, the listeners registered with it
//! and every connection they produce. Application logic plugs in through
//! the [`Handler`] trait; other threads reach the dispatcher only through a
//! [`DispatcherHandle`].

mod dispatcher;
mod handle;
mod handler;
mod table;

pub use dispatcher::Dispatcher;
pub use handle::{Command, DispatcherHandle};
pub use handler::Handler;
pub use table::Ctx;
