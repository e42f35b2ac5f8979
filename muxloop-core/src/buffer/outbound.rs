//! Ordered queue of byte segments awaiting flush to a connection.
//!
//! Owned bytes are packed into [`Buffer`] segments; files can be queued as
//! read-only memory mappings so their contents reach the socket without
//! being copied into a connection buffer.

use super::Buffer;
use memmap2::Mmap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, IoSlice, Write};

/// Maximum number of segments gathered into one vectored write.
pub const MAX_IOVECS: usize = 64;

/// One pending range of bytes.
enum Segment {
    /// Owned bytes in drain mode.
    Bytes(Buffer),

    /// A mapped file region; `pos` is the next byte to send.
    Mapped { map: Mmap, pos: usize },
}

impl Segment {
    fn chunk(&self) -> &[u8] {
        match self {
            Self::Bytes(buf) => buf.as_slice(),
            Self::Mapped { map, pos } => &map[*pos..],
        }
    }

    fn len(&self) -> usize {
        self.chunk().len()
    }

    fn advance(&mut self, n: usize) {
        match self {
            Self::Bytes(buf) => buf.consume(n),
            Self::Mapped { pos, .. } => *pos += n,
        }
    }
}

/// Outbound byte queue of a connection.
pub struct OutboundQueue {
    segments: VecDeque<Segment>,

    /// Total unsent bytes across all segments.
    queued: usize,

    /// Capacity of newly allocated byte segments.
    segment_capacity: usize,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("segments", &self.segments.len())
            .field("queued", &self.queued)
            .finish()
    }
}

impl OutboundQueue {
    /// Creates an empty queue whose byte segments hold `segment_capacity` bytes.
    pub fn new(segment_capacity: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            queued: 0,
            segment_capacity: segment_capacity.max(1),
        }
    }

    /// Unsent bytes.
    pub fn len(&self) -> usize {
        self.queued
    }

    /// True when nothing is waiting to be flushed.
    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Number of pending segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Copies `bytes` to the tail of the queue.
    pub fn push(&mut self, mut bytes: &[u8]) {
        self.queued += bytes.len();

        if let Some(Segment::Bytes(tail)) = self.segments.back_mut() {
            let n = tail.write(bytes);
            bytes = &bytes[n..];
        }

        while !bytes.is_empty() {
            let mut seg = Buffer::new(self.segment_capacity.max(bytes.len().min(1 << 20)));
            let n = seg.write(bytes);
            bytes = &bytes[n..];
            self.segments.push_back(Segment::Bytes(seg));
        }
    }

    /// Queues an owned vector without copying it.
    pub fn push_vec(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.queued += bytes.len();
        self.segments.push_back(Segment::Bytes(Buffer::from(bytes)));
    }

    /// Queues the whole contents of `file` as a memory-mapped segment.
    ///
    /// Returns the number of bytes queued; empty files queue nothing.
    pub fn push_file(&mut self, file: &File) -> io::Result<usize> {
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(0);
        }

        // Safety: the mapping is read-only. Truncating the file while it is
        // queued is the caller's responsibility, as with any mmap.
        let map = unsafe { Mmap::map(file)? };
        let len = map.len();
        self.queued += len;
        self.segments.push_back(Segment::Mapped { map, pos: 0 });
        Ok(len)
    }

    /// Discards everything still queued.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.queued = 0;
    }

    /// Writes queued bytes to `sink` until it would block or the queue empties.
    ///
    /// Several segments are gathered into one vectored write; a single
    /// byte segment is drained directly. Returns the bytes written.
    pub fn flush_into<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while !self.segments.is_empty() {
            if self.segments.len() == 1 {
                if let Some(Segment::Bytes(buf)) = self.segments.front_mut() {
                    let n = buf.drain_into(sink)?;
                    total += n;
                    self.queued -= n;
                    if buf.is_empty() {
                        self.segments.pop_front();
                    }
                    break;
                }
            }

            let written = {
                let slices: Vec<IoSlice<'_>> = self
                    .segments
                    .iter()
                    .take(MAX_IOVECS)
                    .map(|seg| IoSlice::new(seg.chunk()))
                    .collect();

                match sink.write_vectored(&slices) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "sink accepted zero bytes",
                        ))
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };

            self.advance(written);
            total += written;
        }

        Ok(total)
    }

    /// Advances across segment boundaries after a write of `n` bytes.
    fn advance(&mut self, mut n: usize) {
        self.queued -= n;
        while n > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            let len = front.len();
            if n >= len {
                n -= len;
                self.segments.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `chunk` bytes per call, gathered across slices.
    struct SlowSink {
        chunk: usize,
        calls: usize,
        out: Vec<u8>,
    }

    impl Write for SlowSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_vectored(&[IoSlice::new(buf)])
        }

        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            self.calls += 1;
            let mut left = self.chunk;
            let mut n = 0;
            for b in bufs {
                let take = b.len().min(left);
                self.out.extend_from_slice(&b[..take]);
                left -= take;
                n += take;
                if left == 0 {
                    break;
                }
            }
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_push_spills_into_new_segments() {
        let mut queue = OutboundQueue::new(4);
        queue.push(b"abc");
        queue.push(b"defgh");
        assert_eq!(queue.len(), 8);
        assert_eq!(queue.segment_count(), 2);
    }

    #[test]
    fn test_partial_vectored_writes_cross_segments() {
        let mut queue = OutboundQueue::new(4);
        queue.push(b"hello ");
        queue.push_vec(b"scatter".to_vec());
        queue.push(b" gather");

        let mut sink = SlowSink {
            chunk: 5,
            calls: 0,
            out: Vec::new(),
        };
        let written = queue.flush_into(&mut sink).unwrap();

        assert_eq!(written, 20);
        assert_eq!(sink.calls, 4);
        assert!(queue.is_empty());
        assert_eq!(queue.segment_count(), 0);
        assert_eq!(sink.out, b"hello scatter gather");
    }

    #[test]
    fn test_flush_stops_on_would_block() {
        struct Blocked;
        impl Write for Blocked {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = OutboundQueue::new(16);
        queue.push(b"pending");
        queue.push_vec(b"more".to_vec());
        assert_eq!(queue.flush_into(&mut Blocked).unwrap(), 0);
        assert_eq!(queue.len(), 11);
    }

    #[test]
    fn test_mapped_file_segment() {
        let path = std::env::temp_dir().join(format!("muxloop_outbound_{}", std::process::id()));
        std::fs::write(&path, b"mapped file contents").unwrap();

        let file = File::open(&path).unwrap();
        let mut queue = OutboundQueue::new(8);
        queue.push(b"header:");
        assert_eq!(queue.push_file(&file).unwrap(), 20);
        assert_eq!(queue.len(), 27);

        let mut out = Vec::new();
        queue.flush_into(&mut out).unwrap();
        assert_eq!(out, b"header:mapped file contents");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_empty_file_queues_nothing() {
        let path = std::env::temp_dir().join(format!("muxloop_empty_{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let file = File::open(&path).unwrap();
        let mut queue = OutboundQueue::new(8);
        assert_eq!(queue.push_file(&file).unwrap(), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.segment_count(), 0);

        let _ = std::fs::remove_file(&path);
    }
}
