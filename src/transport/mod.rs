//! Realtime transport boundary.
//!
//! The wire layer (handshake, framing, reconnect/backoff timing) lives behind
//! the [`Transport`] trait; the pool only depends on its usage contract:
//! - `connect()` / `disconnect()` lifecycle,
//! - a request/response `call(method, args)` primitive,
//! - lifecycle notifications and server-pushed book updates delivered through
//!   a single event channel, in wire-arrival order.
//!
//! One `Transport` instance backs exactly one physical connection; the pool
//! creates them through a [`TransportFactory`].

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure at the protocol/network layer of a hub call.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("call failed: {0}")]
    Call(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,
}

/// Lifecycle and push notifications from one physical connection.
///
/// `Connected` fires once per successful initial handshake, `Reconnected` on
/// every subsequent re-establishment. `Push` carries the raw payload of a
/// server-pushed book-update message.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Reconnected,
    Disconnected,
    Push(Value),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or re-establish) the physical connection. Lifecycle
    /// progress is reported through the event channel, not the return value.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear the connection down. No further events are expected.
    async fn disconnect(&self);

    /// Invoke a hub method and await its response.
    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, TransportError>;

    /// Take the event receiver for this connection. Yields `Some` exactly
    /// once; the pool owns the receiver for the connection's lifetime.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

/// Creates one transport per connection slot; the argument is the slot id
/// (useful for per-connection scripting in tests).
pub type TransportFactory = Arc<dyn Fn(u64) -> Arc<dyn Transport> + Send + Sync>;
