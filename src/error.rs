//! Error taxonomy for the feed client.
//!
//! Three failure classes matter to callers:
//! - `Transport`: the hub call failed at the protocol/network layer.
//! - `ProtocolRejection`: the call succeeded but the hub returned a falsy or
//!   ill-shaped result. Handled identically to a transport failure.
//! - `SubscribeTimeout`: a hub call never resolved within the configured
//!   window. Without this the whole subscribe queue would wedge behind it.
//!
//! Any of these during either subscribe phase fully discards the half-created
//! market; no partially-subscribed state is ever exposed.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol rejection: {0}")]
    ProtocolRejection(String),

    #[error("{method} timed out")]
    SubscribeTimeout { method: &'static str },

    #[error("connection pool is closed")]
    PoolClosed,
}

impl FeedError {
    pub fn rejection(msg: impl Into<String>) -> Self {
        Self::ProtocolRejection(msg.into())
    }
}
