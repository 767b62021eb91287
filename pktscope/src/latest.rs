use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::format::LogLine;

/// Single-slot holder of the most recently logged line.
///
/// `set` overwrites the slot under a write lock, so `get` sees either the old
/// or the new line in full. The generation counter lets followers notice a
/// new line without copying the slot.
pub struct LatestRecordCache {
    slot: RwLock<LogLine>,
    generation: AtomicU64,
}

impl LatestRecordCache {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(LogLine::EMPTY),
            generation: AtomicU64::new(0),
        }
    }

    pub fn set(&self, line: &LogLine) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = *line;
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// The latest line, or [`LogLine::EMPTY`] if nothing has been observed.
    pub fn get(&self) -> LogLine {
        *self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `set` calls so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for LatestRecordCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_until_set() {
        let cache = LatestRecordCache::new();
        assert!(cache.get().is_empty());
        assert_eq!(cache.generation(), 0);

        let line = LogLine::from_text("hello\n").unwrap();
        cache.set(&line);
        assert_eq!(cache.get(), line);
        assert_eq!(cache.generation(), 1);
    }

    #[test]
    fn test_set_overwrites() {
        let cache = LatestRecordCache::new();
        cache.set(&LogLine::from_text("a long first line\n").unwrap());
        cache.set(&LogLine::from_text("b\n").unwrap());
        assert_eq!(cache.get().as_bytes(), b"b\n");
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn test_readers_never_see_partial_lines() {
        let cache = Arc::new(LatestRecordCache::new());
        let short = LogLine::from_text("s\n").unwrap();
        let long = LogLine::from_text(&format!("{}\n", "L".repeat(200))).unwrap();

        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..5_000 {
                    cache.set(if i % 2 == 0 { &short } else { &long });
                }
            })
        };

        for _ in 0..5_000 {
            let seen = cache.get();
            assert!(seen.is_empty() || seen == short || seen == long);
        }
        writer.join().unwrap();
    }
}
