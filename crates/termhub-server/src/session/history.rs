//! Bounded output history for replay on reattach.
//!
//! Keeps the last N bytes of terminal output so that a reconnecting client
//! sees the recent past without the server keeping unbounded history.

use std::sync::{Mutex, MutexGuard};

/// Capacity used when the configured size is zero (1 MiB).
pub const FALLBACK_CAPACITY: usize = 1024 * 1024;

#[derive(Debug)]
struct Ring {
    buf: Vec<u8>,
    /// Next byte to overwrite.
    pos: usize,
    /// Set once `pos` has passed the end at least once.
    wrapped: bool,
}

/// A fixed-capacity, thread-safe circular byte buffer.
///
/// Each `write` and `snapshot` holds the lock for its whole duration, so a
/// snapshot always reflects a point between two writes.
#[derive(Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    inner: Mutex<Ring>,
}

impl HistoryBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            FALLBACK_CAPACITY
        } else {
            capacity
        };
        Self {
            capacity,
            inner: Mutex::new(Ring {
                buf: vec![0u8; capacity],
                pos: 0,
                wrapped: false,
            }),
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append bytes, overwriting the oldest data once full.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut ring = self.ring();
        for &byte in data {
            let pos = ring.pos;
            ring.buf[pos] = byte;
            ring.pos += 1;
            if ring.pos >= self.capacity {
                ring.pos = 0;
                ring.wrapped = true;
            }
        }
    }

    /// All retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let ring = self.ring();
        if !ring.wrapped {
            return ring.buf[..ring.pos].to_vec();
        }
        let mut result = Vec::with_capacity(self.capacity);
        result.extend_from_slice(&ring.buf[ring.pos..]);
        result.extend_from_slice(&ring.buf[..ring.pos]);
        result
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        let ring = self.ring();
        if ring.wrapped {
            self.capacity
        } else {
            ring.pos
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn basic_write_snapshot() {
        let hb = HistoryBuffer::new(10);
        hb.write(b"hello");
        assert_eq!(hb.snapshot(), b"hello");
        assert_eq!(hb.len(), 5);
    }

    #[test]
    fn exact_fill_then_wrap() {
        let hb = HistoryBuffer::new(5);
        hb.write(b"abcde");
        assert_eq!(hb.snapshot(), b"abcde");
        hb.write(b"fg");
        assert_eq!(hb.snapshot(), b"cdefg");
        assert_eq!(hb.len(), 5);
    }

    #[test]
    fn keeps_last_bytes_regardless_of_call_granularity() {
        let hb = HistoryBuffer::new(4);
        for chunk in [&b"ab"[..], b"c", b"defgh", b"", b"ij"] {
            hb.write(chunk);
        }
        assert_eq!(hb.snapshot(), b"ghij");

        let big = HistoryBuffer::new(4);
        big.write(b"0123456789");
        assert_eq!(big.snapshot(), b"6789");
    }

    #[test]
    fn empty_buffer() {
        let hb = HistoryBuffer::new(10);
        assert!(hb.is_empty());
        assert_eq!(hb.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn empty_write_is_noop() {
        let hb = HistoryBuffer::new(3);
        hb.write(b"xyz");
        let before = hb.snapshot();
        hb.write(b"");
        assert_eq!(hb.snapshot(), before);
    }

    #[test]
    fn zero_capacity_falls_back() {
        let hb = HistoryBuffer::new(0);
        assert_eq!(hb.capacity(), FALLBACK_CAPACITY);
        hb.write(b"test");
        assert_eq!(hb.snapshot(), b"test");
    }

    #[test]
    fn concurrent_snapshots_are_whole_writes() {
        // Each writer emits 8-byte records of a single repeated letter; a
        // snapshot taken mid-stream must consist of whole records only.
        let hb = Arc::new(HistoryBuffer::new(64));
        let writers: Vec<_> = (0..4u8)
            .map(|w| {
                let hb = hb.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        hb.write(&[b'a' + w; 8]);
                    }
                })
            })
            .collect();

        let mut last_len = 0;
        for _ in 0..200 {
            let snap = hb.snapshot();
            assert_eq!(snap.len() % 8, 0);
            assert!(snap.len() >= last_len);
            for record in snap.chunks(8) {
                assert!(record.iter().all(|&b| b == record[0]), "torn record: {record:?}");
            }
            last_len = snap.len();
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(hb.len(), 64);
    }
}
