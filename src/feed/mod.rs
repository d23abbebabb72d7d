//! Feed core: per-pair book reconciliation and connection pooling.

pub mod ladder; // one book side: price-unique sorted levels
pub mod market; // snapshot/delta reconciliation state machine
pub mod metrics; // atomic health counters
pub mod pool; // connection pool, subscription admission, reconnect replay
pub mod wire; // upstream message shapes and boundary validation

pub use ladder::{BookSide, Ladder, PriceLevel};
pub use market::{Market, MarketEvent};
pub use metrics::{FeedMetrics, FeedMetricsSummary};
pub use pool::{ConnectionPool, ConnectionStats, PoolEvent, PoolStats};
pub use wire::{
    ChangeType, DeltaLevel, DeltaMessage, Fill, MarketSnapshot, OrderType, SnapshotLevel,
};
