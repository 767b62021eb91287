use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::format::{format_record, FormatOverflow, LogLine};
use crate::latest::LatestRecordCache;
use crate::record::{self, Stage};
use crate::store::{AppendOutcome, LogStore};

/// Verdict handed back to the network stack. Packets are only ever observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
}

/// Producer-side counters, updated lock-free.
#[derive(Default)]
pub struct SnifferStats {
    pub packets_seen: AtomicU64,
    pub lines_logged: AtomicU64,
    pub parse_skips: AtomicU64,
    pub format_overflows: AtomicU64,
    pub log_resets: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_seen: u64,
    pub lines_logged: u64,
    pub parse_skips: u64,
    pub format_overflows: u64,
    pub log_resets: u64,
}

impl SnifferStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            lines_logged: self.lines_logged.load(Ordering::Relaxed),
            parse_skips: self.parse_skips.load(Ordering::Relaxed),
            format_overflows: self.format_overflows.load(Ordering::Relaxed),
            log_resets: self.log_resets.load(Ordering::Relaxed),
        }
    }
}

/// Everything the producer path writes and the read endpoints query.
///
/// Owned by the process and shared by `Arc` with every registered hook and
/// with the HTTP layer.
pub struct SnifferContext {
    pub store: LogStore,
    pub latest: LatestRecordCache,
    pub stats: SnifferStats,
}

impl SnifferContext {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            store: LogStore::new(log_capacity),
            latest: LatestRecordCache::new(),
            stats: SnifferStats::default(),
        }
    }

    /// Handle one packet seen at `stage`.
    ///
    /// Runs on the delivery path: it never blocks beyond the store's short
    /// critical sections and never fails. Anything that goes wrong only
    /// costs this packet its log line.
    pub fn observe(&self, stage: Stage, raw: &[u8]) -> Verdict {
        self.stats.packets_seen.fetch_add(1, Ordering::Relaxed);

        let Some(record) = record::parse(stage, raw) else {
            self.stats.parse_skips.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%stage, len = raw.len(), "not a TCP/UDP IPv4 packet");
            return Verdict::Accept;
        };

        self.publish(stage, format_record(&record));
        Verdict::Accept
    }

    /// Append a rendered line to the log and make it the latest one. A line
    /// that failed to render leaves both untouched.
    fn publish(&self, stage: Stage, rendered: Result<LogLine, FormatOverflow>) {
        let line = match rendered {
            Ok(line) => line,
            Err(e) => {
                self.stats.format_overflows.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%stage, "dropping log line: {}", e);
                return;
            }
        };

        if self.store.append(&line) == AppendOutcome::Reset {
            self.stats.log_resets.fetch_add(1, Ordering::Relaxed);
        }
        self.latest.set(&line);
        self.stats.lines_logged.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-stage entry point handed to the interception service.
#[derive(Clone)]
pub struct HookDispatcher {
    stage: Stage,
    ctx: Arc<SnifferContext>,
}

impl HookDispatcher {
    pub fn new(stage: Stage, ctx: Arc<SnifferContext>) -> Self {
        Self { stage, ctx }
    }

    pub fn on_packet(&self, raw: &[u8]) -> Verdict {
        self.ctx.observe(self.stage, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures;
    use crate::store::DEFAULT_CAPACITY;
    use std::thread;

    #[test]
    fn test_tcp_packet_is_logged_and_cached() {
        let ctx = Arc::new(SnifferContext::new(DEFAULT_CAPACITY));
        let hook = HookDispatcher::new(Stage::PreRouting, ctx.clone());

        let pkt = fixtures::tcp([10, 0, 0, 1], 5000, [10, 0, 0, 2], 80);
        assert_eq!(hook.on_packet(&pkt), Verdict::Accept);

        let expected = b"PRE_ROUTING [TCP]: SRC=10.0.0.1:5000 DST=10.0.0.2:80\n";
        assert_eq!(ctx.latest.get().as_bytes(), expected);
        assert_eq!(ctx.store.snapshot(), &expected[..]);

        let stats = ctx.stats.snapshot();
        assert_eq!(stats.packets_seen, 1);
        assert_eq!(stats.lines_logged, 1);
        assert_eq!(stats.parse_skips, 0);
    }

    #[test]
    fn test_unparseable_packets_are_accepted_without_state_change() {
        let ctx = Arc::new(SnifferContext::new(DEFAULT_CAPACITY));
        let hook = HookDispatcher::new(Stage::PostRouting, ctx.clone());

        hook.on_packet(&fixtures::udp([1, 1, 1, 1], 53, [2, 2, 2, 2], 5353));
        let log_before = ctx.store.snapshot();
        let latest_before = ctx.latest.get();

        let icmp = fixtures::icmp_echo([10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(hook.on_packet(&icmp), Verdict::Accept);
        assert_eq!(hook.on_packet(&[]), Verdict::Accept);
        assert_eq!(hook.on_packet(&[0xff; 3]), Verdict::Accept);

        assert_eq!(ctx.store.snapshot(), log_before);
        assert_eq!(ctx.latest.get(), latest_before);
        assert_eq!(ctx.stats.snapshot().parse_skips, 3);
    }

    #[test]
    fn test_stages_share_the_log() {
        let ctx = Arc::new(SnifferContext::new(DEFAULT_CAPACITY));
        let pre = HookDispatcher::new(Stage::PreRouting, ctx.clone());
        let post = HookDispatcher::new(Stage::PostRouting, ctx.clone());

        pre.on_packet(&fixtures::tcp([10, 0, 0, 1], 1000, [10, 0, 0, 2], 443));
        post.on_packet(&fixtures::udp([10, 0, 0, 2], 53, [10, 0, 0, 1], 1000));

        let log = ctx.store.snapshot();
        let text = std::str::from_utf8(&log).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "PRE_ROUTING [TCP]: SRC=10.0.0.1:1000 DST=10.0.0.2:443",
                "POST_ROUTING [UDP]: SRC=10.0.0.2:53 DST=10.0.0.1:1000",
            ]
        );
        assert!(ctx.latest.get().as_bytes().starts_with(b"POST_ROUTING"));
    }

    #[test]
    fn test_overflow_keeps_suffix_of_whole_lines() {
        let ctx = Arc::new(SnifferContext::new(DEFAULT_CAPACITY));
        let hook = HookDispatcher::new(Stage::PreRouting, ctx.clone());

        let mut expected_lines = Vec::new();
        for i in 0..200u16 {
            let pkt = fixtures::tcp([192, 168, 0, 1], 10000 + i, [192, 168, 0, 2], 8080);
            hook.on_packet(&pkt);
            expected_lines.push(format!(
                "PRE_ROUTING [TCP]: SRC=192.168.0.1:{} DST=192.168.0.2:8080\n",
                10000 + i
            ));
        }
        assert!(expected_lines.concat().len() > DEFAULT_CAPACITY);

        let log = ctx.store.snapshot();
        assert!(log.len() <= DEFAULT_CAPACITY);
        let text = std::str::from_utf8(&log).unwrap();
        assert!(text.ends_with('\n'));

        let kept: Vec<String> = text.split_inclusive('\n').map(String::from).collect();
        let suffix = &expected_lines[expected_lines.len() - kept.len()..];
        assert_eq!(kept, suffix);
        assert!(ctx.stats.snapshot().log_resets >= 1);
        assert_eq!(ctx.latest.get().as_bytes(), expected_lines[199].as_bytes());
    }

    #[test]
    fn test_overflowing_line_is_dropped_whole() {
        let ctx = SnifferContext::new(DEFAULT_CAPACITY);
        ctx.observe(
            Stage::PreRouting,
            &fixtures::tcp([10, 0, 0, 1], 5000, [10, 0, 0, 2], 80),
        );
        let log_before = ctx.store.snapshot();
        let latest_before = ctx.latest.get();

        let too_long = "x".repeat(crate::format::MAX_LINE_LEN + 1);
        ctx.publish(Stage::PostRouting, LogLine::from_text(&too_long));

        assert_eq!(ctx.store.snapshot(), log_before);
        assert_eq!(ctx.latest.get(), latest_before);
        let stats = ctx.stats.snapshot();
        assert_eq!(stats.format_overflows, 1);
        assert_eq!(stats.lines_logged, 1);
    }

    #[test]
    fn test_parallel_producers_accept_everything() {
        let ctx = Arc::new(SnifferContext::new(DEFAULT_CAPACITY));
        let handles: Vec<_> = Stage::ALL
            .into_iter()
            .flat_map(|stage| (0..4u8).map(move |n| (stage, n)))
            .map(|(stage, n)| {
                let hook = HookDispatcher::new(stage, ctx.clone());
                thread::spawn(move || {
                    for port in 0..300u16 {
                        let pkt = fixtures::tcp([10, 0, n, 1], port, [10, 0, n, 2], 80);
                        assert_eq!(hook.on_packet(&pkt), Verdict::Accept);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = ctx.stats.snapshot();
        assert_eq!(stats.packets_seen, 2 * 4 * 300);
        assert_eq!(stats.lines_logged, 2 * 4 * 300);

        let log = ctx.store.snapshot();
        let text = std::str::from_utf8(&log).unwrap();
        for line in text.lines() {
            assert!(record_line_is_whole(line), "torn line {line:?}");
        }
    }

    fn record_line_is_whole(line: &str) -> bool {
        let Some((label, rest)) = line.split_once(" [TCP]: SRC=") else {
            return false;
        };
        let Some((src, dst)) = rest.split_once(" DST=") else {
            return false;
        };
        matches!(label, "PRE_ROUTING" | "POST_ROUTING")
            && src.parse::<std::net::SocketAddrV4>().is_ok()
            && dst.parse::<std::net::SocketAddrV4>().is_ok()
    }
}
