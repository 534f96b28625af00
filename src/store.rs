use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::metrics::METRICS;
use crate::schema::{Exchange, Quote};

/// Store key: one top-of-book slot per (exchange, canonical pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteKey {
    pub exchange: Exchange,
    pub pair: String,
}

impl QuoteKey {
    pub fn of(quote: &Quote) -> Self {
        Self {
            exchange: quote.exchange,
            pair: quote.pair.clone(),
        }
    }
}

/// Change event emitted on every accepted `put`.
#[derive(Debug, Clone)]
pub struct QuoteChanged {
    pub quote: Quote,
    /// The quote this one replaced, if the key existed.
    pub prev: Option<Quote>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    /// Rejected: `sequence` did not advance past the stored quote.
    Stale,
}

/// The shared hot-path store: latest top-of-book per (exchange, pair).
///
/// Concurrency:
/// - Writers (collectors) shard naturally by key; each `put` is atomic
///   under the map's per-shard lock, so the sequence check and the
///   replacement cannot interleave.
/// - Readers (detector, hub) never block writers: `get` clones one
///   entry, `snapshot` clones the map shard by shard.
///
/// Fan-out is a bounded broadcast channel. A consumer that falls
/// behind sees `Lagged` and re-reads ground truth from the store;
/// intermediate updates are droppable because the store always holds
/// the latest accepted quote per key.
pub struct TopOfBookStore {
    quotes: DashMap<QuoteKey, Quote>,
    stale_exchanges: DashMap<Exchange, ()>,
    events: broadcast::Sender<QuoteChanged>,
}

impl TopOfBookStore {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            quotes: DashMap::new(),
            stale_exchanges: DashMap::new(),
            events,
        }
    }

    /// Inserts or replaces the quote for its key.
    ///
    /// CONTRACT:
    /// - Rejected unless `quote.sequence` is strictly greater than the
    ///   stored sequence for the same key.
    /// - On accept, a `QuoteChanged` carrying the new quote and the
    ///   previous one is broadcast.
    pub fn put(&self, quote: Quote) -> PutOutcome {
        let key = QuoteKey::of(&quote);

        let prev = match self.quotes.entry(key) {
            Entry::Occupied(mut occ) => {
                if quote.sequence <= occ.get().sequence {
                    METRICS.stale_quotes_rejected.fetch_add(1, Ordering::Relaxed);
                    return PutOutcome::Stale;
                }
                Some(occ.insert(quote.clone()))
            }
            Entry::Vacant(vac) => {
                vac.insert(quote.clone());
                None
            }
        };

        METRICS.quotes_accepted.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(QuoteChanged { quote, prev });
        PutOutcome::Accepted
    }

    pub fn get(&self, exchange: Exchange, pair: &str) -> Option<Quote> {
        self.quotes
            .get(&QuoteKey {
                exchange,
                pair: pair.to_string(),
            })
            .map(|q| q.clone())
    }

    /// Point-in-time copy of every stored quote.
    ///
    /// Consistency is per entry, not global: concurrent writers may
    /// land between shards. That is enough for snapshot fan-out, which
    /// only needs each quote to be internally coherent.
    pub fn snapshot(&self) -> Vec<Quote> {
        self.quotes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Excludes the exchange's quotes from detection until it streams
    /// again. Called by a collector after a protracted disconnect.
    pub fn mark_exchange_stale(&self, exchange: Exchange) {
        log::warn!("marking {exchange} stale: quotes excluded from detection");
        self.stale_exchanges.insert(exchange, ());
    }

    pub fn mark_exchange_live(&self, exchange: Exchange) {
        if self.stale_exchanges.remove(&exchange).is_some() {
            log::info!("{exchange} is streaming again");
        }
    }

    pub fn is_stale(&self, exchange: Exchange) -> bool {
        self.stale_exchanges.contains_key(&exchange)
    }

    /// Removes every quote for the exchange. Used on operator stop of
    /// a venue and after an outage long enough that even stale quotes
    /// mislead.
    pub fn clear_exchange(&self, exchange: Exchange) {
        self.quotes.retain(|k, _| k.exchange != exchange);
    }

    /// New consumers of the change stream.
    pub fn subscribe(&self) -> broadcast::Receiver<QuoteChanged> {
        self.events.subscribe()
    }
}
