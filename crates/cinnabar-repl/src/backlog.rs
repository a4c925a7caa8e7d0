//! Bounded byte ring of propagated command frames.

use std::collections::VecDeque;

use bytes::Bytes;
use cinnabar_types::ReplOffset;

/// A fixed-capacity ring of the exact bytes propagated to replicas.
///
/// Every byte has a position in a monotonically increasing 64-bit stream;
/// the ring covers `[start_offset, current_offset)`. Appends past capacity
/// drop the oldest bytes, advancing `start_offset`. Offsets never reset
/// within the lifetime of a primary; monotonic growth is what makes
/// partial resync decidable.
///
/// # Invariants
///
/// - `start_offset <= current_offset`
/// - `current_offset - start_offset == buf.len() <= capacity`
#[derive(Debug)]
pub struct Backlog {
    buf: VecDeque<u8>,
    capacity: usize,
    start_offset: ReplOffset,
    current_offset: ReplOffset,
}

impl Backlog {
    /// Creates an empty backlog holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "backlog capacity must be non-zero");
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            start_offset: ReplOffset::ZERO,
            current_offset: ReplOffset::ZERO,
        }
    }

    /// Oldest stream position still covered.
    pub fn start_offset(&self) -> ReplOffset {
        self.start_offset
    }

    /// Position one past the newest byte.
    pub fn current_offset(&self) -> ReplOffset {
        self.current_offset
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends propagated bytes, evicting the oldest past capacity.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
        self.current_offset += bytes.len() as u64;
        self.start_offset = ReplOffset::new(self.current_offset.as_u64() - self.buf.len() as u64);

        debug_assert!(self.start_offset <= self.current_offset);
        debug_assert!(self.buf.len() <= self.capacity);
    }

    /// True when `offset` can be served incrementally.
    pub fn covers(&self, offset: ReplOffset) -> bool {
        self.start_offset <= offset && offset <= self.current_offset
    }

    /// The suffix `[offset, current_offset)` as freshly owned bytes, or
    /// `None` when `offset` has fallen out of the window.
    pub fn slice_from(&self, offset: ReplOffset) -> Option<Bytes> {
        if !self.covers(offset) {
            return None;
        }
        let skip = offset.distance_from(self.start_offset) as usize;
        Some(self.buf.iter().skip(skip).copied().collect::<Vec<u8>>().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn append_advances_offsets() {
        let mut backlog = Backlog::new(1024);
        backlog.append(b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(backlog.start_offset(), ReplOffset::ZERO);
        assert_eq!(backlog.current_offset(), ReplOffset::new(14));
        assert_eq!(backlog.len(), 14);
    }

    #[test]
    fn slice_from_returns_suffix() {
        let mut backlog = Backlog::new(1024);
        backlog.append(b"hello");
        backlog.append(b" world");

        assert_eq!(&backlog.slice_from(ReplOffset::ZERO).unwrap()[..], b"hello world");
        assert_eq!(&backlog.slice_from(ReplOffset::new(5)).unwrap()[..], b" world");
        // The very tip is an empty, but valid, slice.
        assert_eq!(&backlog.slice_from(ReplOffset::new(11)).unwrap()[..], b"");
        assert!(backlog.slice_from(ReplOffset::new(12)).is_none());
    }

    #[test]
    fn overflow_drops_oldest_bytes() {
        let mut backlog = Backlog::new(8);
        backlog.append(b"abcd");
        backlog.append(b"efgh");
        backlog.append(b"ij");

        assert_eq!(backlog.current_offset(), ReplOffset::new(10));
        assert_eq!(backlog.start_offset(), ReplOffset::new(2));
        assert_eq!(&backlog.slice_from(ReplOffset::new(2)).unwrap()[..], b"cdefghij");
        assert!(backlog.slice_from(ReplOffset::new(1)).is_none());
    }

    #[test]
    fn oversized_append_keeps_the_tail() {
        let mut backlog = Backlog::new(4);
        backlog.append(b"0123456789");
        assert_eq!(backlog.current_offset(), ReplOffset::new(10));
        assert_eq!(backlog.start_offset(), ReplOffset::new(6));
        assert_eq!(&backlog.slice_from(ReplOffset::new(6)).unwrap()[..], b"6789");
    }

    proptest! {
        /// The window invariants hold across any append sequence.
        #[test]
        fn window_invariants(
            chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64),
                0..64,
            )
        ) {
            let mut backlog = Backlog::new(128);
            let mut total: u64 = 0;
            for chunk in &chunks {
                backlog.append(chunk);
                total += chunk.len() as u64;

                prop_assert!(backlog.start_offset() <= backlog.current_offset());
                prop_assert_eq!(backlog.current_offset(), ReplOffset::new(total));
                prop_assert!(backlog.len() <= 128);
                prop_assert_eq!(
                    backlog.current_offset().distance_from(backlog.start_offset()),
                    backlog.len() as u64
                );
            }
        }

        /// Whatever the window holds equals the tail of everything appended.
        #[test]
        fn window_content_is_stream_tail(
            chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 1..32),
                1..32,
            )
        ) {
            let mut backlog = Backlog::new(64);
            let mut stream = Vec::new();
            for chunk in &chunks {
                backlog.append(chunk);
                stream.extend_from_slice(chunk);
            }

            let start = backlog.start_offset().as_u64() as usize;
            let window = backlog.slice_from(backlog.start_offset()).unwrap();
            prop_assert_eq!(&window[..], &stream[start..]);
        }
    }
}
