//! Fixed-capacity byte buffer with separate read and write cursors.
//!
//! The buffer never reallocates on its own. Whether it is being filled or
//! drained is implied by the cursors: bytes are appended at the write cursor
//! (up to `limit`) and consumed from the read cursor (up to the write cursor).
//!
//! Invariant: `0 <= read <= write <= limit <= capacity`.

use std::io::{self, Read, Write};

/// Outcome of [`Buffer::fill_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// `n > 0` bytes were read from the source.
    Read(usize),

    /// The source had nothing to offer right now. Not a terminal condition.
    Pending,

    /// There is no room between the write cursor and the limit.
    /// The source was not touched.
    Full,

    /// The source reported end-of-stream.
    EndOfStream,
}

/// A byte region with independent read and write cursors.
#[derive(Default)]
pub struct Buffer {
    /// Backing storage; its length is the capacity.
    data: Box<[u8]>,

    /// Everything before this has been consumed.
    read: usize,

    /// Everything before this has been written.
    write: usize,

    /// Upper bound for writes.
    limit: usize,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("limit", &self.limit)
            .finish()
    }
}

impl Buffer {
    /// Creates an empty buffer with a fixed capacity. The limit starts at the capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            limit: capacity,
        }
    }

    /// Total size of the backing storage.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current write limit.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Moves the write limit.
    ///
    /// The value is clamped so the cursor invariant keeps holding: it never
    /// drops below the write cursor nor exceeds the capacity.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.clamp(self.write, self.capacity());
    }

    /// Read cursor position.
    #[inline]
    pub fn read_cursor(&self) -> usize {
        self.read
    }

    /// Write cursor position.
    #[inline]
    pub fn write_cursor(&self) -> usize {
        self.write
    }

    /// Number of unread bytes.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// Room left before the limit.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.write
    }

    /// True when there is nothing left to read.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// True when no more bytes can be written before the limit.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.write == self.limit
    }

    /// The unread bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// Copies as many bytes as fit before the limit. Returns 0 when full.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data[self.write..self.write + n].copy_from_slice(&bytes[..n]);
        self.write += n;
        n
    }

    /// Marks `n` unread bytes as consumed. Resets the cursors once drained.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the readable bytes.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.readable(),
            "consume({}) exceeds readable bytes ({})",
            n,
            self.readable()
        );
        self.read += n;
        if self.read == self.write {
            self.reset();
        }
    }

    /// Offers the unread bytes to `sink` until it stops accepting them.
    ///
    /// Partial writes are expected; the read cursor advances by what the
    /// sink actually took. A sink that would block ends the loop without
    /// error. Returns the number of bytes drained by this call.
    pub fn drain_into<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_empty() {
            match sink.write(self.as_slice()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "sink accepted zero bytes",
                    ))
                }
                Ok(n) => {
                    self.consume(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Offers the region between the write cursor and the limit to `source`.
    ///
    /// End-of-stream and "nothing available now" are reported as distinct
    /// outcomes. A full buffer is reported without calling the source,
    /// since a zero-length read would be indistinguishable from end-of-stream.
    pub fn fill_from<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<Fill> {
        if self.remaining() == 0 {
            return Ok(Fill::Full);
        }

        loop {
            match source.read(&mut self.data[self.write..self.limit]) {
                Ok(0) => return Ok(Fill::EndOfStream),
                Ok(n) => {
                    self.write += n;
                    return Ok(Fill::Read(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Shifts unread bytes to offset 0.
    ///
    /// Afterwards `read_cursor() == 0` and `write_cursor()` equals the
    /// number of unread bytes.
    pub fn compact(&mut self) {
        if self.read == 0 {
            return;
        }

        let unread = self.readable();
        if unread > 0 {
            self.data.copy_within(self.read..self.write, 0);
        }
        self.read = 0;
        self.write = unread;
    }

    /// Sets both cursors to 0, discarding any unread bytes.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Replaces the storage with a larger one, keeping unread bytes.
    ///
    /// The unread bytes are compacted to offset 0 in the new storage. The
    /// limit moves to the new capacity. Requests that do not grow the
    /// buffer are ignored.
    pub fn grow(&mut self, capacity: usize) {
        if capacity <= self.capacity() {
            return;
        }

        let mut data = vec![0u8; capacity].into_boxed_slice();
        let unread = self.readable();
        data[..unread].copy_from_slice(self.as_slice());

        self.data = data;
        self.read = 0;
        self.write = unread;
        self.limit = capacity;
    }
}

impl From<Vec<u8>> for Buffer {
    /// Wraps `bytes` as a full buffer ready to be drained.
    fn from(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            data: bytes.into_boxed_slice(),
            read: 0,
            write: len,
            limit: len,
        }
    }
}
