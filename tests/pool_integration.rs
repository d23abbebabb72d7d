//! End-to-end connection pool scenarios over the scripted transport.
//!
//! These exercise the pool contracts that only show up across module
//! boundaries: subscription admission under the per-connection cap, pool-wide
//! serialization of the two-phase subscribe protocol, failure isolation, and
//! reconnect replay with fill recovery.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::sleep;

use exchange_feed::transport::mock::ScriptedTransport;
use exchange_feed::transport::{Transport, TransportError, TransportEvent, TransportFactory};
use exchange_feed::{ConnectionPool, FeedConfig, FeedError, MarketEvent, PoolEvent};

const SUBSCRIBE: &str = "SubscribeToExchangeDeltas";
const QUERY: &str = "QueryExchangeState";

type Created = Arc<Mutex<Vec<Arc<ScriptedTransport>>>>;

fn empty_snapshot(sequence: u64) -> Value {
    json!({ "sequence": sequence, "bids": [], "asks": [], "fills": [] })
}

/// Factory recording every created transport, with no scripted behavior.
fn scripted_factory() -> (TransportFactory, Created) {
    build_factory(false)
}

/// Factory whose transports acknowledge every subscribe and answer every
/// state query with an empty snapshot.
fn auto_factory() -> (TransportFactory, Created) {
    build_factory(true)
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

fn build_factory(auto_respond: bool) -> (TransportFactory, Created) {
    init_tracing();
    let created: Created = Arc::new(Mutex::new(Vec::new()));
    let list = created.clone();
    let factory: TransportFactory = Arc::new(move |_| {
        let t = Arc::new(ScriptedTransport::new());
        if auto_respond {
            t.set_responder(|method, _| match method {
                SUBSCRIBE => Ok(json!(true)),
                QUERY => Ok(json!({ "sequence": 1, "bids": [], "asks": [], "fills": [] })),
                other => Err(TransportError::Call(format!("unexpected method {other}"))),
            });
        }
        list.lock().push(t.clone());
        t as Arc<dyn Transport>
    });
    (factory, created)
}

async fn transport_at(created: &Created, index: usize) -> Arc<ScriptedTransport> {
    loop {
        if let Some(t) = created.lock().get(index).cloned() {
            return t;
        }
        sleep(Duration::from_millis(2)).await;
    }
}

fn call_pairs(calls: &[(String, Vec<Value>)]) -> Vec<(String, String)> {
    calls
        .iter()
        .map(|(method, args)| {
            let pair = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            (method.clone(), pair)
        })
        .collect()
}

#[tokio::test]
async fn test_market_is_idempotent() {
    let (factory, created) = auto_factory();
    let pool = ConnectionPool::spawn(FeedConfig::default(), factory);

    let first = pool.market("BTC-USD").await.unwrap();
    let second = pool.market("BTC-USD").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // The repeat request caused no additional network traffic.
    let t = transport_at(&created, 0).await;
    assert_eq!(t.calls().len(), 2);
    assert!(first.is_ready());
}

#[tokio::test]
async fn test_subscription_cap_spills_to_second_connection() {
    let (factory, _created) = auto_factory();
    let pool = ConnectionPool::spawn(FeedConfig::default(), factory);

    let pairs: Vec<String> = (1..=25).map(|i| format!("P{i}-USD")).collect();
    for pair in &pairs {
        pool.market(pair).await.unwrap();
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.connections.len(), 2);
    assert_eq!(stats.connections[0].subscribed_pairs, pairs[..20].to_vec());
    assert_eq!(stats.connections[1].subscribed_pairs, pairs[20..].to_vec());
    assert_eq!(stats.markets, 25);
}

#[tokio::test]
async fn test_two_phase_subscribe_is_serialized_pool_wide() {
    let (factory, created) = scripted_factory();
    let pool = ConnectionPool::spawn(FeedConfig::default(), factory);

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.market("AAA-USD").await })
    };
    sleep(Duration::from_millis(10)).await;
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.market("BBB-USD").await })
    };

    let t = transport_at(&created, 0).await;

    // Phase 1 of the first request starts; the second request must not have
    // issued anything yet.
    t.wait_for_calls(1).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(
        call_pairs(&t.calls()),
        vec![(SUBSCRIBE.to_string(), "AAA-USD".to_string())]
    );

    // Completing phase 1 starts phase 2 of the same pair, still nothing for
    // the second request.
    t.script_result(SUBSCRIBE, Ok(json!(true)));
    t.wait_for_calls(2).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(t.calls().len(), 2);
    assert_eq!(t.calls()[1].0, QUERY);

    // Only after the first protocol completes does the second one start.
    t.script_result(QUERY, Ok(empty_snapshot(1)));
    assert!(first.await.unwrap().is_ok());

    t.wait_for_calls(3).await;
    t.script_result(SUBSCRIBE, Ok(json!(true)));
    t.wait_for_calls(4).await;
    t.script_result(QUERY, Ok(empty_snapshot(1)));
    assert!(second.await.unwrap().is_ok());

    assert_eq!(
        call_pairs(&t.calls()),
        vec![
            (SUBSCRIBE.to_string(), "AAA-USD".to_string()),
            (QUERY.to_string(), "AAA-USD".to_string()),
            (SUBSCRIBE.to_string(), "BBB-USD".to_string()),
            (QUERY.to_string(), "BBB-USD".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_failed_subscribe_does_not_block_queued_request() {
    let (factory, created) = scripted_factory();
    let pool = ConnectionPool::spawn(FeedConfig::default(), factory);

    // Queue B then C back to back; B's delta subscription is refused.
    let b = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.market("BBB-USD").await })
    };
    sleep(Duration::from_millis(10)).await;
    let c = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.market("CCC-USD").await })
    };

    let t = transport_at(&created, 0).await;
    t.script_result(SUBSCRIBE, Ok(json!(false))); // B refused
    t.script_result(SUBSCRIBE, Ok(json!(true))); // C acknowledged
    t.script_result(QUERY, Ok(empty_snapshot(1)));

    assert!(matches!(
        b.await.unwrap(),
        Err(FeedError::ProtocolRejection(_))
    ));
    let market_c = c.await.unwrap().unwrap();
    assert!(market_c.is_ready());

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.markets, 1);
    assert_eq!(
        stats.connections[0].subscribed_pairs,
        vec!["CCC-USD".to_string()]
    );
}

#[tokio::test]
async fn test_subscribes_queue_until_connection_established() {
    init_tracing();
    let created: Created = Arc::new(Mutex::new(Vec::new()));
    let list = created.clone();
    let factory: TransportFactory = Arc::new(move |_| {
        let t = Arc::new(ScriptedTransport::new().with_manual_connect());
        t.set_responder(|method, _| match method {
            SUBSCRIBE => Ok(json!(true)),
            QUERY => Ok(json!({ "sequence": 1, "bids": [], "asks": [], "fills": [] })),
            other => Err(TransportError::Call(format!("unexpected method {other}"))),
        });
        list.lock().push(t.clone());
        t as Arc<dyn Transport>
    });
    let pool = ConnectionPool::spawn(FeedConfig::default(), factory);
    let mut pool_events = pool.subscribe_events();

    let pending = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.market("AAA-USD").await })
    };

    // The connection exists but has never connected: the request waits, no
    // call goes out.
    let t = transport_at(&created, 0).await;
    sleep(Duration::from_millis(30)).await;
    assert!(t.calls().is_empty());
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.queued_subscribes, 1);

    t.release_connect();
    let market = pending.await.unwrap().unwrap();
    assert!(market.is_ready());
    assert_eq!(pool_events.recv().await, Some(PoolEvent::Connected { conn: 0 }));
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions_in_order_and_recovers_fills() {
    let (factory, created) = scripted_factory();
    let pool = ConnectionPool::spawn(FeedConfig::default(), factory);

    let t = {
        let pool = pool.clone();
        let handle = tokio::spawn(async move { pool.market("AAA-USD").await });
        let t = transport_at(&created, 0).await;
        t.script_result(SUBSCRIBE, Ok(json!(true)));
        t.script_result(QUERY, Ok(empty_snapshot(1)));
        handle.await.unwrap().unwrap();
        t
    };
    t.script_result(SUBSCRIBE, Ok(json!(true)));
    t.script_result(QUERY, Ok(empty_snapshot(1)));
    let market_a = pool.market("AAA-USD").await.unwrap();
    let market_b = pool.market("BBB-USD").await.unwrap();
    let mut fills_rx = market_a.subscribe();

    // A live fill sets AAA's watermark at 00:00:20.
    t.emit(TransportEvent::Push(json!({
        "pair": "AAA-USD",
        "sequence": 2,
        "fills": [{
            "orderType": "SELL",
            "quantity": 1.0,
            "price": 100.0,
            "timestamp": "2024-01-01T00:00:20Z"
        }]
    })));
    match fills_rx.recv().await {
        Some(MarketEvent::Fills(fills)) => assert_eq!(fills.len(), 1),
        other => panic!("expected live fill batch, got {other:?}"),
    }

    // Replay snapshots: AAA's carries fill history spanning the watermark.
    t.script_result(SUBSCRIBE, Ok(json!(true)));
    t.script_result(SUBSCRIBE, Ok(json!(true)));
    t.script_result(
        QUERY,
        Ok(json!({
            "sequence": 10,
            "bids": [],
            "asks": [],
            "fills": [
                {"orderType": "BUY", "quantity": 1.0, "price": 100.0, "timestamp": "2024-01-01T00:00:10Z"},
                {"orderType": "SELL", "quantity": 1.0, "price": 100.0, "timestamp": "2024-01-01T00:00:20Z"},
                {"orderType": "BUY", "quantity": 2.0, "price": 101.0, "timestamp": "2024-01-01T00:00:30Z"},
                {"orderType": "SELL", "quantity": 3.0, "price": 102.0, "timestamp": "2024-01-01T00:00:40Z"}
            ]
        })),
    );
    t.script_result(QUERY, Ok(empty_snapshot(3)));

    t.emit(TransportEvent::Disconnected);
    t.emit(TransportEvent::Reconnected);

    // Both pairs replay, in original subscription order.
    t.wait_for_calls(8).await;
    assert_eq!(
        call_pairs(&t.calls())[4..],
        vec![
            (SUBSCRIBE.to_string(), "AAA-USD".to_string()),
            (QUERY.to_string(), "AAA-USD".to_string()),
            (SUBSCRIBE.to_string(), "BBB-USD".to_string()),
            (QUERY.to_string(), "BBB-USD".to_string()),
        ]
    );

    // Catch-up batch is exactly the fills strictly after the watermark.
    match fills_rx.recv().await {
        Some(MarketEvent::Fills(fills)) => {
            let times: Vec<String> = fills.iter().map(|f| f.timestamp.to_rfc3339()).collect();
            assert_eq!(
                times,
                vec![
                    "2024-01-01T00:00:30+00:00".to_string(),
                    "2024-01-01T00:00:40+00:00".to_string(),
                ]
            );
        }
        other => panic!("expected catch-up fill batch, got {other:?}"),
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(
        stats.connections[0].subscribed_pairs,
        vec!["AAA-USD".to_string(), "BBB-USD".to_string()]
    );
    assert!(market_a.is_ready());
    assert!(market_b.is_ready());
    assert_eq!(pool.metrics().summary().resubscribes_ok, 2);
}

#[tokio::test]
async fn test_resubscribe_failure_is_observable_and_discards_market() {
    let (factory, created) = scripted_factory();
    let pool = ConnectionPool::spawn(FeedConfig::default(), factory);
    let mut pool_events = pool.subscribe_events();

    let t = {
        let pool = pool.clone();
        let handle = tokio::spawn(async move { pool.market("AAA-USD").await });
        let t = transport_at(&created, 0).await;
        t.script_result(SUBSCRIBE, Ok(json!(true)));
        t.script_result(QUERY, Ok(empty_snapshot(1)));
        handle.await.unwrap().unwrap();
        t
    };
    assert_eq!(pool_events.recv().await, Some(PoolEvent::Connected { conn: 0 }));

    // Replay is refused outright.
    t.script_result(SUBSCRIBE, Ok(json!(false)));
    t.emit(TransportEvent::Disconnected);
    t.emit(TransportEvent::Reconnected);

    match pool_events.recv().await {
        Some(PoolEvent::ResubscribeFailed { pair, .. }) => assert_eq!(pair, "AAA-USD"),
        other => panic!("expected resubscribe failure event, got {other:?}"),
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.markets, 0);
    assert!(stats.connections[0].subscribed_pairs.is_empty());
    assert_eq!(pool.metrics().summary().resubscribes_failed, 1);
}

#[tokio::test]
async fn test_deltas_arriving_before_snapshot_are_reconciled() {
    let (factory, created) = scripted_factory();
    let pool = ConnectionPool::spawn(FeedConfig::default(), factory);

    let pending = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.market("AAA-USD").await })
    };

    let t = transport_at(&created, 0).await;
    t.script_result(SUBSCRIBE, Ok(json!(true)));
    // The delta stream races ahead of the snapshot response.
    t.wait_for_calls(2).await;
    for (seq, price) in [(4u64, 104.0), (5, 105.0), (6, 106.0)] {
        t.emit(TransportEvent::Push(json!({
            "pair": "AAA-USD",
            "sequence": seq,
            "bids": [{"price": price, "quantity": 1.0, "changeType": "upsert"}]
        })));
    }
    sleep(Duration::from_millis(20)).await;
    t.script_result(
        QUERY,
        Ok(json!({
            "sequence": 5,
            "bids": [{"price": 100.0, "quantity": 2.0}],
            "asks": [],
            "fills": []
        })),
    );

    let market = pending.await.unwrap().unwrap();
    // Sequence 4 predates the snapshot; 5 and 6 layer on top of it.
    let prices: Vec<f64> = market.bids().iter().map(|l| l.price).collect();
    assert_eq!(prices, vec![106.0, 105.0, 100.0]);
    assert_eq!(pool.metrics().summary().stale_deltas_dropped, 1);
}
