//! Upstream message shapes.
//!
//! Shapes are fixed by the exchange protocol; field semantics are preserved
//! exactly. Hub responses and pushed deltas arrive as loose JSON and are
//! validated here, at the boundary; a shape mismatch is a
//! `ProtocolRejection`, never a panic deeper in the pipeline.
//!
//! Sequence numbers are per-pair monotonically increasing integers assigned
//! upstream; they align pushed deltas with the point-in-time snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FeedError;

/// How a delta entry modifies its price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Upsert,
    Delete,
}

/// Aggressor side of a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "BUY", alias = "buy", alias = "Buy")]
    Buy,
    #[serde(rename = "SELL", alias = "sell", alias = "Sell")]
    Sell,
}

/// One (price, quantity) level in a snapshot. Quantity is always positive;
/// absent levels are simply not listed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLevel {
    pub price: f64,
    pub quantity: f64,
}

/// One book change in a delta.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaLevel {
    pub price: f64,
    pub quantity: f64,
    pub change_type: ChangeType,
}

/// A completed trade, as published to subscribers. Wire shape and normalized
/// shape coincide: {orderType, quantity, price, timestamp}.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time book state plus recent fill history, fetched via
/// `QueryExchangeState`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarketSnapshot {
    pub sequence: u64,
    #[serde(default)]
    pub bids: Vec<SnapshotLevel>,
    #[serde(default)]
    pub asks: Vec<SnapshotLevel>,
    #[serde(default)]
    pub fills: Vec<Fill>,
}

/// Incremental pushed update for one pair.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeltaMessage {
    pub pair: String,
    pub sequence: u64,
    #[serde(default)]
    pub bids: Vec<DeltaLevel>,
    #[serde(default)]
    pub asks: Vec<DeltaLevel>,
    #[serde(default)]
    pub fills: Vec<Fill>,
}

impl MarketSnapshot {
    pub fn from_value(value: Value) -> Result<Self, FeedError> {
        if value.is_null() {
            return Err(FeedError::rejection("empty exchange state"));
        }
        serde_json::from_value(value)
            .map_err(|e| FeedError::rejection(format!("malformed exchange state: {e}")))
    }
}

impl DeltaMessage {
    pub fn from_value(value: Value) -> Result<Self, FeedError> {
        serde_json::from_value(value)
            .map_err(|e| FeedError::rejection(format!("malformed delta message: {e}")))
    }
}

/// Upstream "falsy" check for call results that signal success with a bare
/// boolean (the delta-subscribe acknowledgment).
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
