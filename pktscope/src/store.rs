use bytes::Bytes;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::format::{LogLine, MAX_LINE_LEN};

/// Default log capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 4096;

/// What an append did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The line was written after the existing content.
    Appended,
    /// The line did not fit: all earlier content was discarded and the buffer
    /// now holds only this line.
    Reset,
}

struct Ring {
    buf: Box<[u8]>,
    cursor: usize,
}

/// Fixed-capacity, append-only text log with reset-on-overflow.
///
/// The backing buffer is allocated once. When a line does not fit behind the
/// cursor the whole log is dropped and the line is written at offset 0. This
/// is deliberately lossy: older history is sacrificed so that appends stay
/// bounded and allocation-free.
///
/// Appends and snapshots share one mutex. Critical sections are a single
/// bounded `memcpy`, and no parsing or formatting happens while it is held.
pub struct LogStore {
    ring: Mutex<Ring>,
}

impl LogStore {
    /// Capacities below [`MAX_LINE_LEN`] are raised to it so that any line
    /// fits into an empty store.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MAX_LINE_LEN);
        Self {
            ring: Mutex::new(Ring {
                buf: vec![0u8; capacity].into_boxed_slice(),
                cursor: 0,
            }),
        }
    }

    // The ring is consistent between statements, so a panic elsewhere while
    // holding the lock cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.lock().cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&self, line: &LogLine) -> AppendOutcome {
        let bytes = line.as_bytes();
        let mut ring = self.lock();

        let mut outcome = AppendOutcome::Appended;
        if ring.cursor + bytes.len() > ring.buf.len() {
            ring.cursor = 0;
            outcome = AppendOutcome::Reset;
        }

        let start = ring.cursor;
        let end = start + bytes.len();
        ring.buf[start..end].copy_from_slice(bytes);
        ring.cursor = end;
        outcome
    }

    /// Copy of the bytes from offset 0 to the cursor.
    pub fn snapshot(&self) -> Bytes {
        let ring = self.lock();
        Bytes::copy_from_slice(&ring.buf[..ring.cursor])
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
