//! Connection buffers.
//!
//! This module provides the fixed-capacity [`Buffer`] used for inbound data
//! and the [`OutboundQueue`] of pending segments used for outbound data.

mod byte_buffer;
mod outbound;

pub use byte_buffer::{Buffer, Fill};
pub use outbound::{OutboundQueue, MAX_IOVECS};

/// Default capacity of a connection's inbound buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024; // 16 KiB
