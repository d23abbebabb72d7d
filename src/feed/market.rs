//! Per-pair order-book reconciliation.
//!
//! A market reconciles two racing sources: the point-in-time snapshot fetched
//! by `QueryExchangeState` and the pushed delta stream that starts flowing as
//! soon as the delta subscription lands. State machine:
//!
//! Uninitialized -> Initializing (deltas queue untouched) -> Ready
//!
//! While `initialized` is false no delta touches the ladders; everything
//! accumulates in arrival order and is replayed at initialize against the
//! snapshot's sequence boundary. The same gate makes reconnect safe: the pool
//! flips the market back to uninitialized before replaying the subscription,
//! and the fresh snapshot plus the fill watermark recover anything missed
//! during the outage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::ladder::{BookSide, Ladder, PriceLevel};
use super::metrics::FeedMetrics;
use super::wire::{DeltaMessage, Fill, MarketSnapshot};
use crate::events::EventBus;

/// Notifications emitted by one market. FIFO per market; `Ready` fires
/// exactly once over the market's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Ready,
    BookUpdated,
    Fills(Vec<Fill>),
}

struct MarketState {
    initialized: bool,
    bids: Ladder,
    asks: Ladder,
    pending_deltas: VecDeque<DeltaMessage>,
    last_fill_time: Option<DateTime<Utc>>,
}

pub struct Market {
    pair: String,
    ready: AtomicBool,
    state: Mutex<MarketState>,
    events: EventBus<MarketEvent>,
    metrics: Arc<FeedMetrics>,
}

impl Market {
    pub(crate) fn new(pair: impl Into<String>, metrics: Arc<FeedMetrics>) -> Arc<Self> {
        Arc::new(Self {
            pair: pair.into(),
            ready: AtomicBool::new(false),
            state: Mutex::new(MarketState {
                initialized: false,
                bids: Ladder::new(BookSide::Bid),
                asks: Ladder::new(BookSide::Ask),
                pending_deltas: VecDeque::new(),
                last_fill_time: None,
            }),
            events: EventBus::new(),
            metrics,
        })
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    /// True once the first initialization completed. Never reverts, not even
    /// while a reconnect re-initialization is in flight.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Current bid ladder, best (highest) price first.
    pub fn bids(&self) -> Vec<PriceLevel> {
        self.state.lock().bids.levels().to_vec()
    }

    /// Current ask ladder, best (lowest) price first.
    pub fn asks(&self) -> Vec<PriceLevel> {
        self.state.lock().asks.levels().to_vec()
    }

    /// Register for market notifications.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MarketEvent> {
        self.events.subscribe()
    }

    /// Route one pushed delta into the market.
    pub(crate) fn process_delta(&self, msg: DeltaMessage) {
        let mut out = Vec::new();
        {
            let mut st = self.state.lock();
            if !st.initialized {
                st.pending_deltas.push_back(msg);
                FeedMetrics::incr(&self.metrics.deltas_queued);
            } else {
                Self::apply_delta(&mut st, &msg, &mut out);
                FeedMetrics::incr(&self.metrics.deltas_applied);
            }
        }
        self.emit_all(out);
    }

    /// Install the snapshot, replay the queued deltas at or above its
    /// sequence boundary, and on reconnect publish fills missed during the
    /// outage.
    pub(crate) fn initialize(&self, snapshot: &MarketSnapshot) {
        let mut out = Vec::new();
        {
            let mut st = self.state.lock();
            let reconnecting = st.last_fill_time.is_some();

            // A re-initialization replaces stale book state wholesale; the
            // snapshot fully defines the new book. No-op on first init.
            // Dropping a nonempty book counts as a change even when the
            // snapshot itself is empty.
            let mut book_changed = !st.bids.is_empty() || !st.asks.is_empty();
            st.bids.clear();
            st.asks.clear();
            book_changed |= st.bids.apply_snapshot(&snapshot.bids);
            book_changed |= st.asks.apply_snapshot(&snapshot.asks);
            st.initialized = true;
            if book_changed {
                out.push(MarketEvent::BookUpdated);
            }

            // Replay queued deltas in arrival order. Sequences below the
            // snapshot boundary are already reflected in the snapshot;
            // the boundary itself is kept (inclusive comparison).
            let queued: Vec<DeltaMessage> = st.pending_deltas.drain(..).collect();
            for msg in &queued {
                if msg.sequence >= snapshot.sequence {
                    Self::apply_delta(&mut st, msg, &mut out);
                    FeedMetrics::incr(&self.metrics.deltas_applied);
                } else {
                    debug!(
                        pair = %self.pair,
                        delta_seq = msg.sequence,
                        snapshot_seq = snapshot.sequence,
                        "dropping queued delta below snapshot boundary"
                    );
                    FeedMetrics::incr(&self.metrics.stale_deltas_dropped);
                }
            }

            // A watermark from a prior session means this is a reconnect:
            // recover fills that traded during the disconnect from the
            // snapshot's fill history. Strictly newer than the watermark --
            // inclusive here would duplicate the boundary fill.
            if reconnecting {
                if let Some(watermark) = st.last_fill_time {
                    let missed: Vec<Fill> = snapshot
                        .fills
                        .iter()
                        .filter(|f| f.timestamp > watermark)
                        .cloned()
                        .collect();
                    if !missed.is_empty() {
                        debug!(
                            pair = %self.pair,
                            count = missed.len(),
                            "publishing catch-up fills after reconnect"
                        );
                        FeedMetrics::add(
                            &self.metrics.catchup_fills_published,
                            missed.len() as u64,
                        );
                        Self::publish_fills(&mut st, &missed, &mut out);
                    }
                }
            }
        }

        if !self.ready.swap(true, Ordering::AcqRel) {
            out.push(MarketEvent::Ready);
        }
        self.emit_all(out);
    }

    /// Flip back to queueing mode ahead of a subscription replay, so deltas
    /// buffer until the fresh snapshot lands. `ready` is untouched.
    pub(crate) fn begin_resubscribe(&self) {
        self.state.lock().initialized = false;
    }

    fn apply_delta(st: &mut MarketState, msg: &DeltaMessage, out: &mut Vec<MarketEvent>) {
        let bids_changed = st.bids.apply(&msg.bids);
        let asks_changed = st.asks.apply(&msg.asks);
        if bids_changed || asks_changed {
            out.push(MarketEvent::BookUpdated);
        }
        Self::publish_fills(st, &msg.fills, out);
    }

    fn publish_fills(st: &mut MarketState, fills: &[Fill], out: &mut Vec<MarketEvent>) {
        let Some(newest) = fills.last() else {
            return;
        };
        // Monotonic watermark: used both for reconnect dedup and the
        // catch-up scan.
        st.last_fill_time = Some(match st.last_fill_time {
            Some(prev) if prev > newest.timestamp => prev,
            _ => newest.timestamp,
        });
        out.push(MarketEvent::Fills(fills.to_vec()));
    }

    fn emit_all(&self, events: Vec<MarketEvent>) {
        for event in events {
            self.events.publish(&event);
        }
    }

    #[cfg(test)]
    pub(crate) fn last_fill_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_fill_time
    }

    #[cfg(test)]
    pub(crate) fn pending_delta_count(&self) -> usize {
        self.state.lock().pending_deltas.len()
    }
}
