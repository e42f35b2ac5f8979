//! Application callbacks.

use super::table::Ctx;
use crate::net::{CloseReason, Connection};

/// Per-connection application logic.
///
/// Every callback runs on the dispatcher thread and must not block.
/// `Context` is the per-connection state the application attaches with
/// [`Connection::attach`].
pub trait Handler {
    type Context;

    /// A connection was accepted, or an outgoing connect completed.
    fn on_connect(&mut self, conn: &mut Connection<Self::Context>, ctx: &mut Ctx<'_, Self::Context>) {
        let _ = (conn, ctx);
    }

    /// New bytes arrived. `data` holds every unconsumed inbound byte,
    /// oldest first.
    ///
    /// Returns how many bytes of `data` were consumed; the rest is handed
    /// back on the next call together with newer bytes. A handler waiting
    /// for a frame larger than the buffer should call
    /// [`Connection::reserve_inbound`], otherwise reading pauses once the
    /// buffer fills up.
    fn on_data(
        &mut self,
        conn: &mut Connection<Self::Context>,
        data: &[u8],
        ctx: &mut Ctx<'_, Self::Context>,
    ) -> usize;

    /// The outbound queue was fully flushed.
    fn on_writable(&mut self, conn: &mut Connection<Self::Context>, ctx: &mut Ctx<'_, Self::Context>) {
        let _ = (conn, ctx);
    }

    /// The connection reached `Closed`. Called exactly once per connection,
    /// after it has been deregistered.
    fn on_close(
        &mut self,
        conn: &mut Connection<Self::Context>,
        reason: &CloseReason,
        ctx: &mut Ctx<'_, Self::Context>,
    ) {
        let _ = (conn, reason, ctx);
    }
}
