//! Query history and statistics.
//!
//! Every handled query lands in a bounded ring of recent records. The
//! counters that must be read together (total and blocked) live under the
//! same lock as the ring so a snapshot is never torn; packet-level failure
//! counters are independent atomics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// One handled query. Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub domain: String,
    /// Wall-clock time the response was sent, serialized as RFC 3339.
    pub timestamp: DateTime<Utc>,
    pub blocked: bool,
    /// Monotonic time the response was sent.
    #[serde(skip)]
    pub at: Instant,
}

/// Consistent snapshot of the query counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryCounts {
    pub total_queries: u64,
    pub blocked_queries: u64,
}

/// Aggregate statistics reported to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_queries: u64,
    pub blocked_queries: u64,
    pub blocklist_size: usize,
    pub upstream_failures: u64,
    pub malformed_packets: u64,
    /// Seconds since the current run started; 0 when stopped.
    pub uptime_secs: u64,
}

struct Ring {
    records: VecDeque<QueryRecord>,
    total: u64,
    blocked: u64,
}

/// Bounded, thread-safe history of recent queries with running counters.
///
/// Oldest records are evicted once `capacity` is reached. Counters are not
/// affected by eviction and only ever increase.
pub struct QueryLog {
    ring: Mutex<Ring>,
    capacity: usize,
    upstream_failures: AtomicU64,
    malformed_packets: AtomicU64,
}

impl QueryLog {
    /// Create a log holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                records: VecDeque::with_capacity(capacity),
                total: 0,
                blocked: 0,
            }),
            capacity,
            upstream_failures: AtomicU64::new(0),
            malformed_packets: AtomicU64::new(0),
        }
    }

    /// Append a record and bump the counters in one critical section.
    pub fn record(&self, domain: impl Into<String>, blocked: bool) {
        let record = QueryRecord {
            domain: domain.into(),
            timestamp: Utc::now(),
            blocked,
            at: Instant::now(),
        };

        let mut ring = self.ring.lock();
        if ring.records.len() == self.capacity {
            ring.records.pop_front();
        }
        ring.records.push_back(record);
        ring.total += 1;
        if blocked {
            ring.blocked += 1;
        }
    }

    /// Up to `limit` records, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<QueryRecord> {
        let ring = self.ring.lock();
        ring.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn counts(&self) -> QueryCounts {
        let ring = self.ring.lock();
        QueryCounts {
            total_queries: ring.total,
            blocked_queries: ring.blocked,
        }
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_failures(&self) -> u64 {
        self.upstream_failures.load(Ordering::Relaxed)
    }

    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        self.ring.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryLog {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counts_every_record_including_duplicates() {
        let log = QueryLog::new(10);

        log.record("ads.example.com", true);
        log.record("ads.example.com", true);
        log.record("google.com", false);
        log.record("google.com", false);
        log.record("tracker.net", true);

        assert_eq!(
            log.counts(),
            QueryCounts {
                total_queries: 5,
                blocked_queries: 3
            }
        );
    }

    #[test]
    fn recent_is_most_recent_first() {
        let log = QueryLog::new(10);
        log.record("a.com", false);
        log.record("b.com", true);
        log.record("c.com", false);

        let recent = log.recent(2);

        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].domain, "c.com");
        assert_eq!(recent[1].domain, "b.com");
        assert!(recent[1].blocked);
        assert!(recent[0].at >= recent[1].at);
    }

    #[test]
    fn recent_is_bounded_by_capacity() {
        let log = QueryLog::new(3);
        for i in 0..5 {
            log.record(format!("d{i}.com"), false);
        }

        let recent = log.recent(100);

        assert_eq!(recent.len(), 3);
        let domains: Vec<_> = recent.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(domains, vec!["d4.com", "d3.com", "d2.com"]);
        assert_eq!(log.counts().total_queries, 5);
    }

    #[test]
    fn recent_zero_limit_is_empty() {
        let log = QueryLog::new(3);
        log.record("a.com", false);

        assert!(log.recent(0).is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let log = QueryLog::new(0);
        log.record("a.com", false);
        log.record("b.com", false);

        assert_eq!(log.capacity(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn failure_counters_are_independent() {
        let log = QueryLog::new(3);

        log.record_upstream_failure();
        log.record_malformed();
        log.record_malformed();

        assert_eq!(log.upstream_failures(), 1);
        assert_eq!(log.malformed_packets(), 2);
        assert_eq!(log.counts(), QueryCounts::default());
    }

    #[test]
    fn concurrent_recorders_do_not_lose_counts() {
        let log = Arc::new(QueryLog::new(64));

        std::thread::scope(|scope| {
            for t in 0..8 {
                let log = log.clone();
                scope.spawn(move || {
                    for i in 0..1000 {
                        log.record(format!("t{t}.example"), i % 4 == 0);
                    }
                });
            }
        });

        let counts = log.counts();
        assert_eq!(counts.total_queries, 8000);
        assert_eq!(counts.blocked_queries, 2000);
        assert_eq!(log.len(), 64);
    }

    #[test]
    fn record_serializes_iso_timestamp() {
        let log = QueryLog::new(1);
        log.record("ads.example.com", true);

        let json = serde_json::to_value(&log.recent(1)[0]).unwrap();

        assert_eq!(json["domain"], "ads.example.com");
        assert_eq!(json["blocked"], true);
        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(json.get("at").is_none());
    }
}
