//! Byte producers behind the read endpoints.
//!
//! Every call re-reads the live state (always-current view). A streaming
//! consumer that walks the log with increasing offsets therefore reads from a
//! fresh snapshot each time; if the log was reset in between, offsets past the
//! new end simply return nothing.

use bytes::Bytes;

use crate::dispatch::SnifferContext;

/// The most recent line, or an empty buffer if nothing has been observed.
pub fn read_latest(ctx: &SnifferContext) -> Bytes {
    Bytes::copy_from_slice(ctx.latest.get().as_bytes())
}

/// Everything currently in the log.
pub fn read_log(ctx: &SnifferContext) -> Bytes {
    ctx.store.snapshot()
}

/// Up to `len` bytes of the current log starting at `offset`.
pub fn read_log_chunk(ctx: &SnifferContext, offset: usize, len: Option<usize>) -> Bytes {
    let snapshot = read_log(ctx);
    let start = offset.min(snapshot.len());
    let end = match len {
        Some(len) => start.saturating_add(len).min(snapshot.len()),
        None => snapshot.len(),
    };
    snapshot.slice(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{fixtures, Stage};
    use crate::store::DEFAULT_CAPACITY;

    #[test]
    fn test_read_latest_is_idempotent() {
        let ctx = SnifferContext::new(DEFAULT_CAPACITY);
        assert!(read_latest(&ctx).is_empty());

        ctx.observe(
            Stage::PreRouting,
            &fixtures::tcp([10, 0, 0, 1], 5000, [10, 0, 0, 2], 80),
        );
        let first = read_latest(&ctx);
        let second = read_latest(&ctx);
        assert_eq!(first, second);
        assert_eq!(
            first,
            &b"PRE_ROUTING [TCP]: SRC=10.0.0.1:5000 DST=10.0.0.2:80\n"[..]
        );
    }

    #[test]
    fn test_read_latest_tracks_last_packet() {
        let ctx = SnifferContext::new(DEFAULT_CAPACITY);
        for port in 1..=5u16 {
            ctx.observe(
                Stage::PostRouting,
                &fixtures::udp([10, 0, 0, 1], port, [10, 0, 0, 2], 53),
            );
        }
        assert_eq!(
            read_latest(&ctx),
            &b"POST_ROUTING [UDP]: SRC=10.0.0.1:5 DST=10.0.0.2:53\n"[..]
        );
    }

    #[test]
    fn test_chunked_reads_cover_the_log() {
        let ctx = SnifferContext::new(DEFAULT_CAPACITY);
        for port in 0..10u16 {
            ctx.observe(
                Stage::PreRouting,
                &fixtures::tcp([10, 0, 0, 1], port, [10, 0, 0, 2], 80),
            );
        }
        let full = read_log(&ctx);

        let mut reassembled = Vec::new();
        let mut offset = 0;
        loop {
            let chunk = read_log_chunk(&ctx, offset, Some(37));
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len();
            reassembled.extend_from_slice(&chunk);
        }
        assert_eq!(reassembled, full.to_vec());
    }

    #[test]
    fn test_chunk_bounds() {
        let ctx = SnifferContext::new(DEFAULT_CAPACITY);
        ctx.observe(
            Stage::PreRouting,
            &fixtures::tcp([10, 0, 0, 1], 1, [10, 0, 0, 2], 2),
        );
        let full = read_log(&ctx);

        assert_eq!(read_log_chunk(&ctx, 0, None), full);
        assert!(read_log_chunk(&ctx, full.len(), None).is_empty());
        assert!(read_log_chunk(&ctx, usize::MAX, Some(usize::MAX)).is_empty());
        assert_eq!(read_log_chunk(&ctx, 4, Some(usize::MAX)), full.slice(4..));
    }
}
