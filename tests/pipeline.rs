//! End-to-end scenarios over the in-process pipeline: store →
//! detector → cache, and the dashboard hub over a real websocket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rust_decimal_macros::dec;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use spreadwatch::cache::{self, CacheEvent, OpportunityCache};
use spreadwatch::config::{CacheConfig, DashboardConfig, DetectorConfig};
use spreadwatch::detector;
use spreadwatch::hub::{self, Hub};
use spreadwatch::orderbook::{ApplyOutcome, BookDiff, OrderBook};
use spreadwatch::schema::{Exchange, Quote};
use spreadwatch::store::TopOfBookStore;
use spreadwatch::symbols::SymbolRegistry;

fn quote(exchange: Exchange, bid: &str, ask: &str, bid_vol: &str, ask_vol: &str, seq: u64) -> Quote {
    Quote {
        exchange,
        pair: "ETH/USDT".to_string(),
        bid_price: bid.parse().unwrap(),
        bid_volume: bid_vol.parse().unwrap(),
        ask_price: ask.parse().unwrap(),
        ask_volume: ask_vol.parse().unwrap(),
        timestamp: spreadwatch::util::now_secs(),
        sequence: seq,
    }
}

fn test_registry(tag: &str) -> Arc<SymbolRegistry> {
    let file = r#"{
        "markets": [{
            "canonical_id": "ETH/USDT",
            "base": "ETH", "quote": "USDT",
            "display_name": "ETH/USDT",
            "currency_name": "Ethereum",
            "precision": {"price": 2, "amount": 6},
            "enabled": true
        }],
        "exchange_aliases": [
            {"exchange": "bingx", "native_symbol": "ETH-USDT", "canonical_id": "ETH/USDT"},
            {"exchange": "wallex", "native_symbol": "ETHUSDT", "canonical_id": "ETH/USDT"},
            {"exchange": "ramzinex", "native_symbol": "272", "canonical_id": "ETH/USDT"}
        ]
    }"#;
    let path = std::env::temp_dir().join(format!(
        "spreadwatch-pipeline-{}-{}.json",
        tag,
        std::process::id()
    ));
    std::fs::write(&path, file).unwrap();
    let registry = Arc::new(SymbolRegistry::load(path.to_str().unwrap()).unwrap());
    let _ = std::fs::remove_file(&path);
    registry
}

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn read_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out reading from hub")
            .expect("hub closed the stream")
            .expect("websocket error");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<CacheEvent>) -> CacheEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for cache event")
        .expect("cache event stream ended")
}

/// Two venues quote the same pair with a 0.45% gap; exactly one
/// opportunity comes out, priced off the buy ask and sell bid.
#[tokio::test]
async fn single_pair_opportunity_flows_through_the_pipeline() {
    let store = Arc::new(TopOfBookStore::new(256));
    let shutdown = CancellationToken::new();

    let detector_cfg = DetectorConfig {
        workers: 2,
        min_profit_pct: dec!(0.1),
        inbox: 64,
    };
    let detections = detector::spawn(store.clone(), &detector_cfg, shutdown.clone());

    let opp_cache = Arc::new(OpportunityCache::new());
    let cache_cfg = CacheConfig {
        ttl_secs: 60,
        sweep_interval_secs: 1,
    };
    let mut events = cache::spawn(opp_cache.clone(), &cache_cfg, detections, shutdown.clone());

    store.put(quote(Exchange::Bingx, "2000", "2001", "10", "10", 1));
    store.put(quote(Exchange::Wallex, "2010", "2011", "5", "5", 1));

    let mut inserted = None;
    let mut best = None;
    for _ in 0..2 {
        match next_event(&mut events).await {
            CacheEvent::Inserted(o) => inserted = Some(o),
            CacheEvent::BestChanged(b) => best = b,
        }
    }

    let opp = inserted.expect("no opportunity inserted");
    assert_eq!(opp.buy_exchange, Exchange::Bingx);
    assert_eq!(opp.sell_exchange, Exchange::Wallex);
    assert_eq!(opp.buy_price, dec!(2001));
    assert_eq!(opp.sell_price, dec!(2010));
    assert_eq!(opp.trade_volume, dec!(5));
    assert_eq!(opp.profit_percentage.round_dp(4), dec!(0.4498));

    let best = best.expect("no best reported");
    assert_eq!(best.fingerprint, opp.fingerprint);

    assert_eq!(opp_cache.len(), 1);
    shutdown.cancel();
}

/// Replaying an unchanged market 100 times yields one cache entry
/// whose seen_count tracks every repeat, and no re-broadcast.
#[test]
fn flapping_quotes_dedup_to_one_entry() {
    let store = TopOfBookStore::new(1024);
    let opp_cache = OpportunityCache::new();

    let mut inserted_events = 0;
    for round in 1..=100u64 {
        store.put(quote(Exchange::Bingx, "2000", "2001", "10", "10", round));
        store.put(quote(Exchange::Wallex, "2010", "2011", "5", "5", round));

        let trigger = store.get(Exchange::Wallex, "ETH/USDT").unwrap();
        for opp in detector::scan(&store, &trigger, dec!(0.1)) {
            for event in opp_cache.upsert(opp) {
                if matches!(event, CacheEvent::Inserted(_)) {
                    inserted_events += 1;
                }
            }
        }
    }

    assert_eq!(inserted_events, 1);
    assert_eq!(opp_cache.len(), 1);
    let entry = &opp_cache.snapshot()[0];
    assert_eq!(entry.seen_count, 100);
}

/// A third venue with a clearly better bid takes over "best".
#[test]
fn higher_edge_takes_over_best() {
    let store = TopOfBookStore::new(1024);
    let opp_cache = OpportunityCache::new();

    store.put(quote(Exchange::Bingx, "2000", "2001", "10", "10", 1));
    store.put(quote(Exchange::Wallex, "2010", "2011", "5", "5", 1));
    let trigger = store.get(Exchange::Wallex, "ETH/USDT").unwrap();
    for opp in detector::scan(&store, &trigger, dec!(0.1)) {
        opp_cache.upsert(opp);
    }
    assert_eq!(opp_cache.best().unwrap().sell_exchange, Exchange::Wallex);

    store.put(quote(Exchange::Ramzinex, "2050", "2060", "3", "3", 1));
    let trigger = store.get(Exchange::Ramzinex, "ETH/USDT").unwrap();
    let mut best_changes = Vec::new();
    for opp in detector::scan(&store, &trigger, dec!(0.1)) {
        for event in opp_cache.upsert(opp) {
            if let CacheEvent::BestChanged(b) = event {
                best_changes.push(b);
            }
        }
    }

    let new_best = best_changes
        .last()
        .cloned()
        .flatten()
        .expect("best should have moved");
    assert_eq!(new_best.buy_exchange, Exchange::Bingx);
    assert_eq!(new_best.sell_exchange, Exchange::Ramzinex);
    assert_eq!(new_best.buy_price, dec!(2001));
    assert_eq!(new_best.sell_price, dec!(2050));
    assert_eq!(new_best.profit_percentage.round_dp(2), dec!(2.45));
}

/// The literal diff-continuity walk: apply, then lose one diff for
/// good and watch the book demand a resubscribe.
#[test]
fn diff_continuity_and_resync() {
    let mut book = OrderBook::new();
    book.apply_snapshot(100, &[(dec!(2000), dec!(10))], &[(dec!(2005), dec!(1))]);
    assert_eq!(book.top_bid(), Some((dec!(2000), dec!(10))));

    // Diff 101 deletes 2000 and adds 1999:7.
    let outcome = book.apply_diff(BookDiff {
        id: 101,
        bids: vec![(dec!(2000), dec!(0)), (dec!(1999), dec!(7))],
        asks: vec![],
    });
    assert_eq!(outcome, ApplyOutcome::Applied);
    assert_eq!(book.top_bid(), Some((dec!(1999), dec!(7))));

    // 102 never arrives; later ids can only buffer, then force a
    // resync once the gap is clearly unfillable.
    for id in [103, 104, 105] {
        assert_eq!(
            book.apply_diff(BookDiff {
                id,
                bids: vec![],
                asks: vec![]
            }),
            ApplyOutcome::Buffered
        );
    }
    assert_eq!(
        book.apply_diff(BookDiff {
            id: 106,
            bids: vec![],
            asks: vec![]
        }),
        ApplyOutcome::Resync
    );
    assert!(!book.is_initialized());

    // The resubscribe re-snapshots and the book is whole again.
    book.apply_snapshot(200, &[(dec!(1999), dec!(7))], &[(dec!(2005), dec!(1))]);
    assert_eq!(book.top_bid(), Some((dec!(1999), dec!(7))));
}

/// A dashboard session gets the ordered open sequence over a real
/// websocket, then live updates with symbol metadata stamped on.
#[tokio::test]
async fn dashboard_session_receives_snapshot_then_live_updates() {
    let registry = test_registry("hub");
    let store = Arc::new(TopOfBookStore::new(256));
    let opp_cache = Arc::new(OpportunityCache::new());
    let shutdown = CancellationToken::new();

    // Find a free port, then hand it to the hub.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let dashboard = DashboardConfig {
        listen: addr.to_string(),
        session_queue: 64,
        stats_interval_secs: 60,
        batch_flush_ms: 20,
        batch_max: 8,
    };
    let hub = Hub::new(registry, store.clone(), opp_cache, dashboard);

    let (cache_tx, cache_rx) = tokio::sync::mpsc::channel(16);
    hub::spawn(hub, cache_rx, shutdown.clone()).await.unwrap();

    // Pre-session state that must arrive as the snapshot.
    store.put(quote(Exchange::Bingx, "2000", "2001", "10", "10", 1));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("connect to hub");

    let first = read_json(&mut ws).await;
    assert_eq!(first["type"], "initial_prices");
    let quotes = first["data"].as_array().unwrap();
    assert_eq!(quotes.len(), 1);
    assert_eq!(quotes[0]["symbol"], "ETH/USDT");
    assert_eq!(quotes[0]["display_symbol"], "ETH/USDT");
    assert_eq!(quotes[0]["currency_name"], "Ethereum");
    assert_eq!(quotes[0]["base_currency"], "ETH");

    let second = read_json(&mut ws).await;
    assert_eq!(second["type"], "initial_opportunities");

    let third = read_json(&mut ws).await;
    assert_eq!(third["type"], "best_opportunity_update");
    assert!(third["data"].is_null());

    // Live price update.
    store.put(quote(Exchange::Bingx, "2002", "2003", "9", "9", 2));
    let live = read_json(&mut ws).await;
    assert_eq!(live["type"], "price_update");
    assert_eq!(live["data"]["bid_price"], "2002");

    // Best updates pass straight through the cache event channel.
    cache_tx
        .send(CacheEvent::BestChanged(None))
        .await
        .unwrap();
    let best = read_json(&mut ws).await;
    assert_eq!(best["type"], "best_opportunity_update");

    shutdown.cancel();
}
