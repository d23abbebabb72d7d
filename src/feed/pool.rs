//! Connection pool and subscription admission.
//!
//! Owns every physical connection, assigns new pairs to a connection with
//! spare capacity (the upstream hub caps subscriptions per connection), and
//! serializes the two-phase subscribe protocol pool-wide:
//!
//! 1. `SubscribeToExchangeDeltas(pair)` starts the push stream,
//! 2. `QueryExchangeState(pair)` fetches the snapshot the market
//!    initializes from.
//!
//! A single actor task owns all pool state and advances one command at a
//! time. The protocol phases suspend on transport calls, so they run in a
//! spawned task that reports back through the command channel; at most one
//! protocol instance is in flight pool-wide and everything else waits FIFO.
//! Delta dispatch is not serialized by that flag; it is protected per-market
//! by the initialized gate (queue-until-ready).
//!
//! Serialization is pool-wide, not per-connection: concurrent
//! subscribe-then-query sequences could interleave one pair's state response
//! with another pair's delta traffic and reorder the hub's internal
//! subscription state across connections.
//!
//! Reconnects replay every pair of the affected connection, in original
//! order, through the same serialized entry point. Replay failures have no
//! caller to report to, so they surface as pool events.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::market::Market;
use super::metrics::FeedMetrics;
use super::wire::{is_truthy, DeltaMessage, MarketSnapshot};
use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::events::EventBus;
use crate::transport::{Transport, TransportEvent, TransportFactory};

const SUBSCRIBE_DELTAS: &str = "SubscribeToExchangeDeltas";
const QUERY_STATE: &str = "QueryExchangeState";

/// Notifications emitted by the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A connection completed its first handshake.
    Connected { conn: u64 },
    /// A reconnect-triggered subscription replay failed; the pair's market
    /// has been discarded. Not caller-initiated, hence no error reply;
    /// this event is the observable path.
    ResubscribeFailed { pair: String, error: String },
}

/// Point-in-time view of pool state, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub connections: Vec<ConnectionStats>,
    pub markets: usize,
    pub queued_subscribes: usize,
    pub subscribe_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub id: u64,
    pub connected: bool,
    pub subscribed_pairs: Vec<String>,
}

/// Handle to the pool actor. Cheap to clone; all methods funnel through the
/// actor's command channel.
#[derive(Clone)]
pub struct ConnectionPool {
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
    events: Arc<EventBus<PoolEvent>>,
    metrics: Arc<FeedMetrics>,
}

impl ConnectionPool {
    pub fn spawn(config: FeedConfig, factory: TransportFactory) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(FeedMetrics::new());

        let actor = PoolActor {
            config,
            factory,
            cmd_tx: cmd_tx.clone(),
            markets: HashMap::new(),
            connections: BTreeMap::new(),
            next_conn_id: 0,
            next_req_id: 0,
            active: None,
            queue: VecDeque::new(),
            in_flight: None,
            events: events.clone(),
            metrics: metrics.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            cmd_tx,
            events,
            metrics,
        }
    }

    /// Get (or create) the market for `pair`. Idempotent: an existing pair
    /// resolves immediately with no network round trip. A fresh pair resolves
    /// once the two-phase subscribe completes; on failure the half-created
    /// market is fully discarded and the error returned.
    pub async fn market(&self, pair: &str) -> Result<Arc<Market>, FeedError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Market {
                pair: pair.to_string(),
                reply,
            })
            .map_err(|_| FeedError::PoolClosed)?;
        rx.await.map_err(|_| FeedError::PoolClosed)?
    }

    /// Terminate every connection and clear all pool and market state.
    pub async fn reset(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(PoolCommand::Reset { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn stats(&self) -> Result<PoolStats, FeedError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Stats { reply })
            .map_err(|_| FeedError::PoolClosed)?;
        rx.await.map_err(|_| FeedError::PoolClosed)
    }

    /// Register for pool notifications.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<FeedMetrics> {
        &self.metrics
    }
}

enum PoolCommand {
    Market {
        pair: String,
        reply: oneshot::Sender<Result<Arc<Market>, FeedError>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Conn {
        conn: u64,
        event: TransportEvent,
    },
    ProtocolDone {
        /// Dispatch id of the protocol instance that finished. A reset can
        /// orphan a running instance; its completion must not be attributed
        /// to whatever request is in flight by the time it arrives.
        req_id: u64,
        pair: String,
        result: Result<MarketSnapshot, FeedError>,
    },
    RetryConnect {
        conn: u64,
    },
}

struct SubscribeRequest {
    pair: String,
    conn: u64,
    /// None for reconnect-triggered replays.
    reply: Option<oneshot::Sender<Result<Arc<Market>, FeedError>>>,
    resubscribe: bool,
}

struct ConnectionSlot {
    transport: Arc<dyn Transport>,
    /// Pairs subscribed on this connection, in subscription order. Replayed
    /// verbatim on reconnect, so replay can never exceed the cap either.
    subscribed_pairs: Vec<String>,
    /// Pairs assigned here whose subscribe has not completed yet. Counted
    /// against the cap so a burst of requests cannot overfill the slot.
    pending_assigned: usize,
    connected: bool,
    ever_connected: bool,
}

struct PoolActor {
    config: FeedConfig,
    factory: TransportFactory,
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
    markets: HashMap<String, Arc<Market>>,
    connections: BTreeMap<u64, ConnectionSlot>,
    next_conn_id: u64,
    next_req_id: u64,
    active: Option<u64>,
    queue: VecDeque<SubscribeRequest>,
    in_flight: Option<(u64, SubscribeRequest)>,
    events: Arc<EventBus<PoolEvent>>,
    metrics: Arc<FeedMetrics>,
}

impl PoolActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<PoolCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                PoolCommand::Market { pair, reply } => self.handle_market(pair, reply),
                PoolCommand::Reset { reply } => {
                    self.handle_reset();
                    let _ = reply.send(());
                }
                PoolCommand::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                PoolCommand::Conn { conn, event } => self.handle_conn_event(conn, event),
                PoolCommand::ProtocolDone {
                    req_id,
                    pair,
                    result,
                } => self.handle_protocol_done(req_id, pair, result),
                PoolCommand::RetryConnect { conn } => self.handle_retry_connect(conn),
            }
        }
    }

    fn handle_market(
        &mut self,
        pair: String,
        reply: oneshot::Sender<Result<Arc<Market>, FeedError>>,
    ) {
        if let Some(market) = self.markets.get(&pair) {
            let _ = reply.send(Ok(market.clone()));
            return;
        }

        let conn = self.pick_connection();
        let market = Market::new(pair.clone(), self.metrics.clone());
        // Registered before the protocol runs so deltas that race the
        // snapshot queue inside the market instead of being lost.
        self.markets.insert(pair.clone(), market);
        if let Some(slot) = self.connections.get_mut(&conn) {
            slot.pending_assigned += 1;
        }
        self.queue.push_back(SubscribeRequest {
            pair,
            conn,
            reply: Some(reply),
            resubscribe: false,
        });
        self.maybe_dispatch();
    }

    /// Default assignment target is the active connection; open a fresh one
    /// when the pool is empty or the active connection is at capacity
    /// (subscribed plus pending, so in-flight requests count too).
    fn pick_connection(&mut self) -> u64 {
        if let Some(id) = self.active {
            if let Some(slot) = self.connections.get(&id) {
                if slot.subscribed_pairs.len() + slot.pending_assigned
                    < self.config.max_pairs_per_connection
                {
                    return id;
                }
            }
        }
        self.open_connection()
    }

    fn open_connection(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let transport = (self.factory)(id);

        // Pump transport events into the actor. The pump keeps wire order;
        // it ends when the transport closes its channel or the pool is gone.
        if let Some(mut events) = transport.take_events() {
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tx.send(PoolCommand::Conn { conn: id, event }).is_err() {
                        break;
                    }
                }
            });
        } else {
            warn!(conn = id, "transport event receiver was already taken");
        }

        // Initial connect, off the actor task. Until the Connected event
        // lands this slot queues subscribe requests rather than dropping
        // them.
        let t = transport.clone();
        let tx = self.cmd_tx.clone();
        let wait = self.config.reconnect_wait();
        tokio::spawn(async move {
            if let Err(e) = t.connect().await {
                warn!(conn = id, error = %e, "initial connect failed, scheduling retry");
                tokio::time::sleep(wait).await;
                let _ = tx.send(PoolCommand::RetryConnect { conn: id });
            }
        });

        self.connections.insert(
            id,
            ConnectionSlot {
                transport,
                subscribed_pairs: Vec::new(),
                pending_assigned: 0,
                connected: false,
                ever_connected: false,
            },
        );
        self.active = Some(id);
        info!(conn = id, "opened feed connection");
        id
    }

    /// Start the next queued subscribe if none is in flight and the front
    /// request's connection is usable. FIFO pool-wide: a front request whose
    /// connection has not finished its handshake holds the queue.
    fn maybe_dispatch(&mut self) {
        loop {
            if self.in_flight.is_some() {
                return;
            }
            let Some(front) = self.queue.front() else {
                return;
            };
            let front_conn = front.conn;
            let Some(slot) = self.connections.get(&front_conn) else {
                // Connection vanished under a reset; fail the request.
                if let Some(req) = self.queue.pop_front() {
                    if let Some(reply) = req.reply {
                        let _ = reply.send(Err(FeedError::PoolClosed));
                    }
                }
                continue;
            };
            if !slot.connected {
                return;
            }

            let Some(req) = self.queue.pop_front() else {
                return;
            };
            let transport = slot.transport.clone();
            let pair = req.pair.clone();
            let limit = self.config.call_timeout();
            let tx = self.cmd_tx.clone();
            let req_id = self.next_req_id;
            self.next_req_id += 1;
            debug!(
                pair = %pair,
                conn = req.conn,
                req_id,
                resubscribe = req.resubscribe,
                "starting two-phase subscribe"
            );
            self.in_flight = Some((req_id, req));
            tokio::spawn(async move {
                let result = run_subscribe_protocol(transport.as_ref(), &pair, limit).await;
                let _ = tx.send(PoolCommand::ProtocolDone {
                    req_id,
                    pair,
                    result,
                });
            });
            return;
        }
    }

    fn handle_protocol_done(
        &mut self,
        req_id: u64,
        pair: String,
        result: Result<MarketSnapshot, FeedError>,
    ) {
        // A reset discards the in-flight request but cannot cancel its
        // protocol task; the orphaned completion arrives later, possibly
        // while an unrelated request is in flight. Only the matching id
        // may resolve it.
        if self.in_flight.as_ref().map(|(id, _)| *id) != Some(req_id) {
            debug!(pair = %pair, req_id, "dropping completion of a discarded subscribe");
            return;
        }
        let Some((_, req)) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(snapshot) => self.finish_subscribe_ok(req, snapshot),
            Err(e) => self.finish_subscribe_err(req, e),
        }
        // A failed request must never wedge the pool.
        self.maybe_dispatch();
    }

    fn finish_subscribe_ok(&mut self, req: SubscribeRequest, snapshot: MarketSnapshot) {
        let Some(market) = self.markets.get(&req.pair).cloned() else {
            // Market vanished under a reset between completion and handling.
            if let Some(reply) = req.reply {
                let _ = reply.send(Err(FeedError::PoolClosed));
            }
            return;
        };

        market.initialize(&snapshot);
        if let Some(slot) = self.connections.get_mut(&req.conn) {
            if req.resubscribe {
                // Replay keeps the prior set; nothing to record.
            } else {
                slot.pending_assigned = slot.pending_assigned.saturating_sub(1);
                slot.subscribed_pairs.push(req.pair.clone());
            }
        }
        if req.resubscribe {
            FeedMetrics::incr(&self.metrics.resubscribes_ok);
        } else {
            FeedMetrics::incr(&self.metrics.subscribes_ok);
        }
        info!(
            pair = %req.pair,
            conn = req.conn,
            sequence = snapshot.sequence,
            resubscribe = req.resubscribe,
            "pair subscribed"
        );
        if let Some(reply) = req.reply {
            let _ = reply.send(Ok(market));
        }
    }

    fn finish_subscribe_err(&mut self, req: SubscribeRequest, error: FeedError) {
        warn!(
            pair = %req.pair,
            conn = req.conn,
            error = %error,
            resubscribe = req.resubscribe,
            "subscribe failed, discarding market"
        );
        // Either phase failing discards the market entirely; it is never
        // left half-registered.
        self.markets.remove(&req.pair);
        if let Some(slot) = self.connections.get_mut(&req.conn) {
            if req.resubscribe {
                slot.subscribed_pairs.retain(|p| p != &req.pair);
            } else {
                slot.pending_assigned = slot.pending_assigned.saturating_sub(1);
            }
        }
        if req.resubscribe {
            FeedMetrics::incr(&self.metrics.resubscribes_failed);
            self.events.publish(&PoolEvent::ResubscribeFailed {
                pair: req.pair.clone(),
                error: error.to_string(),
            });
        } else {
            FeedMetrics::incr(&self.metrics.subscribes_failed);
        }
        if let Some(reply) = req.reply {
            let _ = reply.send(Err(error));
        }
    }

    fn handle_conn_event(&mut self, conn: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let first = {
                    let Some(slot) = self.connections.get_mut(&conn) else {
                        debug!(conn, "event for unknown connection ignored");
                        return;
                    };
                    slot.connected = true;
                    !std::mem::replace(&mut slot.ever_connected, true)
                };
                if first {
                    info!(conn, "feed connection established");
                    self.events.publish(&PoolEvent::Connected { conn });
                }
                self.maybe_dispatch();
            }
            TransportEvent::Reconnected => {
                let pairs = {
                    let Some(slot) = self.connections.get_mut(&conn) else {
                        debug!(conn, "event for unknown connection ignored");
                        return;
                    };
                    slot.connected = true;
                    slot.ever_connected = true;
                    slot.subscribed_pairs.clone()
                };
                info!(
                    conn,
                    pairs = pairs.len(),
                    "connection re-established, replaying subscriptions"
                );
                for pair in pairs {
                    if let Some(market) = self.markets.get(&pair) {
                        // Queue deltas again until the fresh snapshot lands.
                        market.begin_resubscribe();
                        self.queue.push_back(SubscribeRequest {
                            pair,
                            conn,
                            reply: None,
                            resubscribe: true,
                        });
                    }
                }
                self.maybe_dispatch();
            }
            TransportEvent::Disconnected => {
                let Some(slot) = self.connections.get_mut(&conn) else {
                    debug!(conn, "event for unknown connection ignored");
                    return;
                };
                slot.connected = false;
                warn!(conn, "feed connection lost, scheduling reconnect");
                let tx = self.cmd_tx.clone();
                let wait = self.config.reconnect_wait();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = tx.send(PoolCommand::RetryConnect { conn });
                });
            }
            TransportEvent::Push(value) => self.route_push(value),
        }
    }

    fn handle_retry_connect(&mut self, conn: u64) {
        let Some(slot) = self.connections.get(&conn) else {
            return;
        };
        if slot.connected {
            return;
        }
        let transport = slot.transport.clone();
        let tx = self.cmd_tx.clone();
        let wait = self.config.reconnect_wait();
        tokio::spawn(async move {
            if let Err(e) = transport.connect().await {
                warn!(conn, error = %e, "reconnect attempt failed");
                tokio::time::sleep(wait).await;
                let _ = tx.send(PoolCommand::RetryConnect { conn });
            }
        });
    }

    /// Route a pushed book-update message by pair name straight into its
    /// market. Pairs without a market (late traffic after an unsubscribe or
    /// reset) are dropped quietly; undecodable payloads are counted.
    fn route_push(&mut self, value: Value) {
        match DeltaMessage::from_value(value) {
            Ok(msg) => match self.markets.get(&msg.pair) {
                Some(market) => market.process_delta(msg),
                None => debug!(pair = %msg.pair, "delta for unknown pair dropped"),
            },
            Err(e) => {
                FeedMetrics::incr(&self.metrics.bad_push_messages);
                warn!(error = %e, "undecodable push message");
            }
        }
    }

    fn handle_reset(&mut self) {
        info!(
            connections = self.connections.len(),
            markets = self.markets.len(),
            "resetting connection pool"
        );
        for slot in self.connections.values() {
            let transport = slot.transport.clone();
            tokio::spawn(async move {
                transport.disconnect().await;
            });
        }
        self.connections.clear();
        self.active = None;
        self.markets.clear();
        if let Some((_, req)) = self.in_flight.take() {
            if let Some(reply) = req.reply {
                let _ = reply.send(Err(FeedError::PoolClosed));
            }
        }
        for req in self.queue.drain(..) {
            if let Some(reply) = req.reply {
                let _ = reply.send(Err(FeedError::PoolClosed));
            }
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            connections: self
                .connections
                .iter()
                .map(|(id, slot)| ConnectionStats {
                    id: *id,
                    connected: slot.connected,
                    subscribed_pairs: slot.subscribed_pairs.clone(),
                })
                .collect(),
            markets: self.markets.len(),
            queued_subscribes: self.queue.len(),
            subscribe_in_flight: self.in_flight.is_some(),
        }
    }
}

/// The two-phase subscribe protocol. Each call is bounded by `limit`; a call
/// that never resolves would otherwise wedge the whole queue behind it.
async fn run_subscribe_protocol(
    transport: &dyn Transport,
    pair: &str,
    limit: std::time::Duration,
) -> Result<MarketSnapshot, FeedError> {
    let args = [Value::String(pair.to_string())];

    let ack = timed_call(transport, SUBSCRIBE_DELTAS, &args, limit).await?;
    if !is_truthy(&ack) {
        return Err(FeedError::rejection(format!(
            "delta subscription refused for {pair}"
        )));
    }

    let state = timed_call(transport, QUERY_STATE, &args, limit).await?;
    MarketSnapshot::from_value(state)
}

async fn timed_call(
    transport: &dyn Transport,
    method: &'static str,
    args: &[Value],
    limit: std::time::Duration,
) -> Result<Value, FeedError> {
    match timeout(limit, transport.call(method, args)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FeedError::Transport(e)),
        Err(_) => Err(FeedError::SubscribeTimeout { method }),
    }
}
