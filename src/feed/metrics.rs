//! Feed health counters.
//!
//! Plain relaxed atomics: writers are on hot paths, readers are logging and
//! tests. A dropped stale delta or an undecodable push is never fatal, but it
//! must be observable.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct FeedMetrics {
    pub subscribes_ok: AtomicU64,
    pub subscribes_failed: AtomicU64,
    pub resubscribes_ok: AtomicU64,
    pub resubscribes_failed: AtomicU64,
    pub deltas_applied: AtomicU64,
    pub deltas_queued: AtomicU64,
    /// Queued deltas discarded at initialize because their sequence was
    /// below the snapshot boundary.
    pub stale_deltas_dropped: AtomicU64,
    pub bad_push_messages: AtomicU64,
    pub catchup_fills_published: AtomicU64,
}

/// Point-in-time copy of the counters, for assertions and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedMetricsSummary {
    pub subscribes_ok: u64,
    pub subscribes_failed: u64,
    pub resubscribes_ok: u64,
    pub resubscribes_failed: u64,
    pub deltas_applied: u64,
    pub deltas_queued: u64,
    pub stale_deltas_dropped: u64,
    pub bad_push_messages: u64,
    pub catchup_fills_published: u64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn summary(&self) -> FeedMetricsSummary {
        FeedMetricsSummary {
            subscribes_ok: self.subscribes_ok.load(Ordering::Relaxed),
            subscribes_failed: self.subscribes_failed.load(Ordering::Relaxed),
            resubscribes_ok: self.resubscribes_ok.load(Ordering::Relaxed),
            resubscribes_failed: self.resubscribes_failed.load(Ordering::Relaxed),
            deltas_applied: self.deltas_applied.load(Ordering::Relaxed),
            deltas_queued: self.deltas_queued.load(Ordering::Relaxed),
            stale_deltas_dropped: self.stale_deltas_dropped.load(Ordering::Relaxed),
            bad_push_messages: self.bad_push_messages.load(Ordering::Relaxed),
            catchup_fills_published: self.catchup_fills_published.load(Ordering::Relaxed),
        }
    }
}
