//! Realtime exchange order-book and fill feed client.
//!
//! Consumes a push-style market-data feed and maintains, per trading pair, a
//! locally consistent order book plus a trade-fill stream. Consistency is
//! reconciled from two racing sources: a point-in-time snapshot
//! (`QueryExchangeState`) and the continuous delta stream started by
//! `SubscribeToExchangeDeltas`. Pair subscriptions are multiplexed over a
//! small number of physical connections (the hub caps subscriptions per
//! connection) and replayed transparently after a disconnect, without losing
//! or duplicating fills.
//!
//! The wire transport itself lives behind [`transport::Transport`]; an
//! in-memory scripted implementation is available in [`transport::mock`].
//!
//! ```no_run
//! use exchange_feed::transport::TransportFactory;
//! use exchange_feed::{ConnectionPool, FeedConfig};
//!
//! # async fn demo(factory: TransportFactory) -> Result<(), exchange_feed::FeedError> {
//! let pool = ConnectionPool::spawn(FeedConfig::from_env(), factory);
//! let market = pool.market("BTC-USD").await?;
//! let mut events = market.subscribe();
//! while let Some(event) = events.recv().await {
//!     println!("{:?} best bid: {:?}", event, market.bids().first());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod transport;

pub use config::FeedConfig;
pub use error::FeedError;
pub use feed::{
    BookSide, ChangeType, ConnectionPool, ConnectionStats, DeltaLevel, DeltaMessage, FeedMetrics,
    FeedMetricsSummary, Fill, Ladder, Market, MarketEvent, MarketSnapshot, OrderType, PoolEvent,
    PoolStats, PriceLevel, SnapshotLevel,
};
pub use transport::{Transport, TransportError, TransportEvent, TransportFactory};
