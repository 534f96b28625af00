use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::DetectorConfig;
use crate::metrics::METRICS;
use crate::schema::{Exchange, Opportunity, Quote};
use crate::store::{QuoteKey, TopOfBookStore};

/// Conflating per-worker inbox.
///
/// Holds at most one pending entry per (exchange, pair). A burst of
/// updates for one key collapses to "this key changed"; the worker
/// re-reads ground truth from the store, so intermediate quotes are
/// droppable by construction. A full inbox can therefore never drop
/// *all* work for a key, only the duplicates.
struct Inbox {
    dirty: Mutex<HashSet<QuoteKey>>,
    notify: Notify,
}

impl Inbox {
    fn new() -> Self {
        Self {
            dirty: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, key: QuoteKey) {
        {
            let mut dirty = self.dirty.lock().expect("detector inbox poisoned");
            if !dirty.insert(key) {
                METRICS.conflation_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<QuoteKey> {
        let mut dirty = self.dirty.lock().expect("detector inbox poisoned");
        dirty.drain().collect()
    }
}

/// Starts the detector: one router plus `workers` scan workers.
///
/// Work is sharded by canonical pair, so every update for a pair is
/// serialized through the same worker and per-pair ordering matches
/// store order. Returns the stream of detected opportunities, which
/// the opportunity cache consumes.
pub fn spawn(
    store: Arc<TopOfBookStore>,
    cfg: &DetectorConfig,
    shutdown: CancellationToken,
) -> mpsc::Receiver<Opportunity> {
    let (tx, rx) = mpsc::channel(cfg.inbox);
    let min_profit = cfg.min_profit_pct;

    let inboxes: Vec<Arc<Inbox>> = (0..cfg.workers.max(1)).map(|_| Arc::new(Inbox::new())).collect();

    // Subscribe before the router task is polled so no event
    // published after this call can be missed.
    let events = store.subscribe();
    tokio::spawn(route(events, inboxes.clone(), shutdown.clone()));
    for inbox in inboxes {
        tokio::spawn(work(store.clone(), inbox, tx.clone(), min_profit, shutdown.clone()));
    }

    rx
}

fn pair_shard(pair: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    pair.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn route(
    mut events: tokio::sync::broadcast::Receiver<crate::store::QuoteChanged>,
    inboxes: Vec<Arc<Inbox>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Ok(changed) => {
                    let key = QuoteKey::of(&changed.quote);
                    let idx = pair_shard(&key.pair, inboxes.len());
                    inboxes[idx].push(key);
                }
                // Fell behind the broadcast; the skipped events were
                // per-key duplicates of state the store still holds.
                Err(RecvError::Lagged(n)) => {
                    METRICS.conflation_drops.fetch_add(n as usize, Ordering::Relaxed);
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}

async fn work(
    store: Arc<TopOfBookStore>,
    inbox: Arc<Inbox>,
    tx: mpsc::Sender<Opportunity>,
    min_profit: Decimal,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Drain what is already queued, then stop.
                scan_keys(&store, &inbox.drain(), min_profit, &tx).await;
                return;
            }
            _ = inbox.notify.notified() => {
                if !scan_keys(&store, &inbox.drain(), min_profit, &tx).await {
                    return;
                }
            }
        }
    }
}

async fn scan_keys(
    store: &TopOfBookStore,
    keys: &[QuoteKey],
    min_profit: Decimal,
    tx: &mpsc::Sender<Opportunity>,
) -> bool {
    for key in keys {
        // Ground truth, not the event payload: the store may have
        // moved past several conflated updates by now.
        let Some(quote) = store.get(key.exchange, &key.pair) else {
            continue;
        };
        for opp in scan(store, &quote, min_profit) {
            METRICS.opportunities_detected.fetch_add(1, Ordering::Relaxed);
            if tx.send(opp).await.is_err() {
                return false;
            }
        }
    }
    true
}

/// One O(exchanges) pass for a changed quote: both directions against
/// every other venue quoting the same pair.
pub fn scan(store: &TopOfBookStore, quote: &Quote, min_profit: Decimal) -> Vec<Opportunity> {
    let mut found = Vec::new();
    if store.is_stale(quote.exchange) {
        return found;
    }

    let now = Utc::now();
    for other in Exchange::all() {
        if other == quote.exchange || store.is_stale(other) {
            continue;
        }
        let Some(counter) = store.get(other, &quote.pair) else {
            continue;
        };

        if let Some(opp) = edge(quote, &counter, min_profit, now) {
            found.push(opp);
        }
        if let Some(opp) = edge(&counter, quote, min_profit, now) {
            found.push(opp);
        }
    }
    found
}

/// Buy at `buy`'s ask, sell at `sell`'s bid, if that clears the
/// threshold with executable volume on both sides.
fn edge(
    buy: &Quote,
    sell: &Quote,
    min_profit: Decimal,
    now: DateTime<Utc>,
) -> Option<Opportunity> {
    if buy.ask_price <= Decimal::ZERO
        || buy.ask_volume <= Decimal::ZERO
        || sell.bid_volume <= Decimal::ZERO
    {
        return None;
    }
    if sell.bid_price <= buy.ask_price {
        return None;
    }

    let profit = (sell.bid_price - buy.ask_price) / buy.ask_price * dec!(100);
    if profit < min_profit {
        return None;
    }

    Some(Opportunity::new(
        buy.pair.clone(),
        buy.exchange,
        sell.exchange,
        buy.ask_price,
        sell.bid_price,
        buy.ask_volume,
        sell.bid_volume,
        now,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(
        exchange: Exchange,
        bid: Decimal,
        ask: Decimal,
        bid_vol: Decimal,
        ask_vol: Decimal,
        seq: u64,
    ) -> Quote {
        Quote {
            exchange,
            pair: "ETH/USDT".to_string(),
            bid_price: bid,
            bid_volume: bid_vol,
            ask_price: ask,
            ask_volume: ask_vol,
            timestamp: crate::util::now_secs(),
            sequence: seq,
        }
    }

    #[test]
    fn single_pair_edge_detected() {
        let store = TopOfBookStore::new(64);
        store.put(quote(Exchange::Bingx, dec!(2000), dec!(2001), dec!(10), dec!(10), 1));
        store.put(quote(Exchange::Wallex, dec!(2010), dec!(2011), dec!(5), dec!(5), 1));

        let trigger = store.get(Exchange::Wallex, "ETH/USDT").unwrap();
        let found = scan(&store, &trigger, dec!(0.1));

        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert_eq!(opp.buy_exchange, Exchange::Bingx);
        assert_eq!(opp.sell_exchange, Exchange::Wallex);
        assert_eq!(opp.buy_price, dec!(2001));
        assert_eq!(opp.sell_price, dec!(2010));
        assert_eq!(opp.trade_volume, dec!(5));
        assert_eq!(opp.profit_percentage.round_dp(4), dec!(0.4498));
    }

    #[test]
    fn no_edge_without_price_gap() {
        let store = TopOfBookStore::new(64);
        store.put(quote(Exchange::Bingx, dec!(2000), dec!(2001), dec!(10), dec!(10), 1));
        store.put(quote(Exchange::Wallex, dec!(2000), dec!(2002), dec!(5), dec!(5), 1));

        let trigger = store.get(Exchange::Bingx, "ETH/USDT").unwrap();
        assert!(scan(&store, &trigger, Decimal::ZERO).is_empty());
    }

    #[test]
    fn threshold_filters_thin_edges() {
        let store = TopOfBookStore::new(64);
        store.put(quote(Exchange::Bingx, dec!(2000), dec!(2001), dec!(10), dec!(10), 1));
        // ~0.0500% gross edge.
        store.put(quote(Exchange::Wallex, dec!(2002), dec!(2003), dec!(5), dec!(5), 1));

        let trigger = store.get(Exchange::Bingx, "ETH/USDT").unwrap();
        assert_eq!(scan(&store, &trigger, dec!(0.01)).len(), 1);
        assert!(scan(&store, &trigger, dec!(0.1)).is_empty());
    }

    #[test]
    fn stale_exchanges_are_excluded() {
        let store = TopOfBookStore::new(64);
        store.put(quote(Exchange::Bingx, dec!(2000), dec!(2001), dec!(10), dec!(10), 1));
        store.put(quote(Exchange::Wallex, dec!(2010), dec!(2011), dec!(5), dec!(5), 1));

        store.mark_exchange_stale(Exchange::Bingx);
        let trigger = store.get(Exchange::Wallex, "ETH/USDT").unwrap();
        assert!(scan(&store, &trigger, Decimal::ZERO).is_empty());

        store.mark_exchange_live(Exchange::Bingx);
        assert_eq!(scan(&store, &trigger, Decimal::ZERO).len(), 1);
    }

    #[test]
    fn zero_volume_sides_never_form_edges() {
        let store = TopOfBookStore::new(64);
        store.put(quote(Exchange::Bingx, dec!(2000), dec!(2001), dec!(10), dec!(0), 1));
        store.put(quote(Exchange::Wallex, dec!(2010), dec!(2011), dec!(5), dec!(5), 1));

        let trigger = store.get(Exchange::Wallex, "ETH/USDT").unwrap();
        assert!(scan(&store, &trigger, Decimal::ZERO).is_empty());
    }

    #[test]
    fn both_directions_are_considered() {
        let store = TopOfBookStore::new(64);
        // Ramzinex bids above bingx asks AND bingx bids above
        // ramzinex asks cannot hold at once with sane books, but two
        // counterparties can both beat a third.
        store.put(quote(Exchange::Bingx, dec!(2000), dec!(2001), dec!(1), dec!(1), 1));
        store.put(quote(Exchange::Wallex, dec!(2010), dec!(2011), dec!(2), dec!(2), 1));
        store.put(quote(Exchange::Ramzinex, dec!(2020), dec!(2021), dec!(3), dec!(3), 1));

        let trigger = store.get(Exchange::Bingx, "ETH/USDT").unwrap();
        let found = scan(&store, &trigger, Decimal::ZERO);
        // bingx→wallex and bingx→ramzinex.
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|o| o.buy_exchange == Exchange::Bingx));
    }

    #[test]
    fn inbox_conflates_per_key() {
        let inbox = Inbox::new();
        let key = QuoteKey {
            exchange: Exchange::Bingx,
            pair: "ETH/USDT".to_string(),
        };
        let before = METRICS.conflation_drops.load(Ordering::Relaxed);
        inbox.push(key.clone());
        inbox.push(key.clone());
        inbox.push(key);
        assert_eq!(inbox.drain().len(), 1);
        assert_eq!(METRICS.conflation_drops.load(Ordering::Relaxed), before + 2);
        assert!(inbox.drain().is_empty());
    }

    #[test]
    fn sharding_is_stable_per_pair() {
        let a = pair_shard("ETH/USDT", 8);
        for _ in 0..10 {
            assert_eq!(pair_shard("ETH/USDT", 8), a);
        }
        assert!(pair_shard("BTC/USDT", 8) < 8);
    }
}
