use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{CacheEvent, OpportunityCache};
use crate::config::DashboardConfig;
use crate::metrics::METRICS;
use crate::schema::{DashboardMessage, Opportunity, Quote, Stats, WireQuote};
use crate::store::TopOfBookStore;
use crate::symbols::SymbolRegistry;

/// Per-session outbound queue with two lanes.
///
/// Bulk events (prices, opportunity batches, stats) share a bounded
/// lane; on overflow the oldest is dropped and the session is flagged
/// stale so the client knows to refresh. Best-opportunity updates ride
/// a separate lane that is drained first and never dropped.
///
/// FIFO holds within each event type; only the best lane overtakes.
struct SessionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    bulk: VecDeque<DashboardMessage>,
    best: VecDeque<DashboardMessage>,
    stale: bool,
    closed: bool,
}

impl SessionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                bulk: VecDeque::new(),
                best: VecDeque::new(),
                stale: false,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Routes by event type: best updates to the priority lane,
    /// everything else to the bounded bulk lane.
    fn push(&self, msg: DashboardMessage) {
        {
            let mut q = self.state.lock().expect("session queue poisoned");
            if q.closed {
                return;
            }
            if msg.is_best_update() {
                q.best.push_back(msg);
            } else {
                if q.bulk.len() >= self.capacity {
                    q.bulk.pop_front();
                    q.stale = true;
                    METRICS.session_events_dropped.fetch_add(1, Ordering::Relaxed);
                }
                q.bulk.push_back(msg);
            }
        }
        self.notify.notify_one();
    }

    /// Session-open snapshots bypass lane routing so the open
    /// sequence reaches the client in order.
    fn push_ordered(&self, msg: DashboardMessage) {
        {
            let mut q = self.state.lock().expect("session queue poisoned");
            if q.closed {
                return;
            }
            q.bulk.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Next message to write, best lane first, with the pending
    /// stale flag (cleared by taking it).
    fn pop(&self) -> PopResult {
        let mut q = self.state.lock().expect("session queue poisoned");
        if let Some(msg) = q.best.pop_front().or_else(|| q.bulk.pop_front()) {
            let stale = std::mem::take(&mut q.stale);
            return PopResult::Event(msg, stale);
        }
        if q.closed {
            PopResult::Closed
        } else {
            PopResult::Empty
        }
    }

    fn close(&self) {
        self.state.lock().expect("session queue poisoned").closed = true;
        self.notify.notify_one();
    }
}

enum PopResult {
    Event(DashboardMessage, bool),
    Empty,
    Closed,
}

/// The broadcast hub: owns dashboard sessions and multiplexes the
/// price stream, opportunity stream and best pointer to all of them.
///
/// The hub holds no pipeline state of its own; it reads snapshots
/// from the store and cache and stamps symbol metadata onto outgoing
/// quotes so subscribers receive self-describing events.
pub struct Hub {
    registry: Arc<SymbolRegistry>,
    store: Arc<TopOfBookStore>,
    cache: Arc<OpportunityCache>,
    sessions: DashMap<Uuid, Arc<SessionQueue>>,
    cfg: DashboardConfig,
    started: Instant,
}

impl Hub {
    pub fn new(
        registry: Arc<SymbolRegistry>,
        store: Arc<TopOfBookStore>,
        cache: Arc<OpportunityCache>,
        cfg: DashboardConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            cache,
            sessions: DashMap::new(),
            cfg,
            started: Instant::now(),
        })
    }

    pub fn store(&self) -> &TopOfBookStore {
        &self.store
    }

    pub fn cache(&self) -> &OpportunityCache {
        &self.cache
    }

    /// Stamps registry metadata onto a quote for the wire. Pairs that
    /// have left the registry (cannot happen without a restart) fall
    /// back to self-derived names.
    pub fn wire_quote(&self, quote: &Quote) -> WireQuote {
        let meta = self.registry.describe(&quote.pair);
        let base = quote.pair.split('/').next().unwrap_or(&quote.pair);
        WireQuote {
            exchange: quote.exchange,
            symbol: quote.pair.clone(),
            display_symbol: meta
                .map(|m| m.display_name.clone())
                .unwrap_or_else(|| quote.pair.clone()),
            base_currency: meta.map(|m| m.base.clone()).unwrap_or_else(|| base.to_string()),
            currency_name: meta
                .map(|m| m.currency_name.clone())
                .unwrap_or_else(|| base.to_string()),
            bid_price: quote.bid_price,
            ask_price: quote.ask_price,
            bid_volume: quote.bid_volume,
            ask_volume: quote.ask_volume,
            timestamp: quote.timestamp,
        }
    }

    pub fn stats(&self) -> Stats {
        let m = &*METRICS;
        Stats {
            prices_count: self.store.len(),
            opportunities_count: self.cache.len(),
            best_profit_percentage: self.cache.best().map(|b| b.profit_percentage),
            uptime_seconds: self.started.elapsed().as_secs() as i64,
            ws_connections_active: m.ws_connections_active.load(Ordering::Relaxed),
            ws_reconnects: m.ws_reconnects.load(Ordering::Relaxed),
            decode_errors: m.decode_errors.load(Ordering::Relaxed),
            protocol_errors: m.protocol_errors.load(Ordering::Relaxed),
            sequence_gaps: m.sequence_gaps.load(Ordering::Relaxed),
            stale_quotes_rejected: m.stale_quotes_rejected.load(Ordering::Relaxed),
            conflation_drops: m.conflation_drops.load(Ordering::Relaxed),
            opportunities_detected: m.opportunities_detected.load(Ordering::Relaxed),
            opportunities_expired: m.opportunities_expired.load(Ordering::Relaxed),
            subscriber_sessions: m.subscriber_sessions.load(Ordering::Relaxed),
            session_events_dropped: m.session_events_dropped.load(Ordering::Relaxed),
        }
    }

    fn broadcast(&self, msg: DashboardMessage) {
        for session in self.sessions.iter() {
            session.value().push(msg.clone());
        }
    }

    fn close_all(&self) {
        for session in self.sessions.iter() {
            session.value().close();
        }
    }
}

/// Binds the listener and starts the accept and dispatch tasks.
/// A bind failure is fatal at startup.
pub async fn spawn(
    hub: Arc<Hub>,
    cache_events: mpsc::Receiver<CacheEvent>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&hub.cfg.listen).await?;
    log::info!("dashboard hub listening on {}", hub.cfg.listen);

    // Subscribe before the dispatch task is polled so no quote
    // published after this call can be missed.
    let quotes = hub.store.subscribe();
    tokio::spawn(accept_loop(hub.clone(), listener, shutdown.clone()));
    tokio::spawn(dispatch(hub, quotes, cache_events, shutdown));
    Ok(())
}

async fn accept_loop(hub: Arc<Hub>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("dashboard session connecting from {peer}");
                    tokio::spawn(run_session(hub.clone(), stream, shutdown.clone()));
                }
                Err(e) => log::warn!("accept failed: {e}"),
            }
        }
    }
}

/// Fan-in of all live event sources, fan-out to every session.
///
/// Newly inserted opportunities are batched: flushed every
/// `batch_flush_ms` or as soon as `batch_max` accumulate. Best
/// changes and prices go out immediately.
async fn dispatch(
    hub: Arc<Hub>,
    mut quotes: tokio::sync::broadcast::Receiver<crate::store::QuoteChanged>,
    mut cache_events: mpsc::Receiver<CacheEvent>,
    shutdown: CancellationToken,
) {
    let mut batch: Vec<Opportunity> = Vec::new();

    let mut flush = tokio::time::interval(Duration::from_millis(hub.cfg.batch_flush_ms.max(1)));
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut stats = tokio::time::interval(Duration::from_secs(hub.cfg.stats_interval_secs.max(1)));
    stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                hub.close_all();
                return;
            }

            quote = quotes.recv() => match quote {
                Ok(changed) => {
                    let wire = hub.wire_quote(&changed.quote);
                    hub.broadcast(DashboardMessage::PriceUpdate(wire));
                }
                Err(RecvError::Lagged(n)) => {
                    // Sessions catch up through their own snapshots;
                    // the skipped price updates are already stale.
                    log::debug!("hub lagged {n} quote events");
                }
                Err(RecvError::Closed) => return,
            },

            event = cache_events.recv() => match event {
                Some(CacheEvent::Inserted(opp)) => {
                    batch.push(opp);
                    if batch.len() >= hub.cfg.batch_max {
                        hub.broadcast(DashboardMessage::OpportunitiesUpdate(std::mem::take(&mut batch)));
                    }
                }
                Some(CacheEvent::BestChanged(best)) => {
                    hub.broadcast(DashboardMessage::BestOpportunityUpdate(best));
                }
                None => return,
            },

            _ = flush.tick() => {
                if !batch.is_empty() {
                    hub.broadcast(DashboardMessage::OpportunitiesUpdate(std::mem::take(&mut batch)));
                }
            }

            _ = stats.tick() => {
                hub.broadcast(DashboardMessage::RedisStats(hub.stats()));
            }
        }
    }
}

/// One dashboard session from websocket upgrade to close.
async fn run_session(hub: Arc<Hub>, stream: TcpStream, shutdown: CancellationToken) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("websocket handshake failed: {e}");
            return;
        }
    };

    let id = Uuid::new_v4();
    let queue = Arc::new(SessionQueue::new(hub.cfg.session_queue));

    // Open sequence: full prices, recent opportunities, current best,
    // then live events.
    let prices: Vec<WireQuote> = hub.store.snapshot().iter().map(|q| hub.wire_quote(q)).collect();
    queue.push_ordered(DashboardMessage::InitialPrices(prices));
    queue.push_ordered(DashboardMessage::InitialOpportunities(hub.cache.snapshot()));
    queue.push_ordered(DashboardMessage::BestOpportunityUpdate(hub.cache.best()));

    hub.sessions.insert(id, queue.clone());
    METRICS.subscriber_sessions.fetch_add(1, Ordering::Relaxed);
    log::info!("dashboard session {id} opened");

    let (mut write, mut read) = ws.split();

    let writer = {
        let queue = queue.clone();
        async move {
            loop {
                match queue.pop() {
                    PopResult::Event(msg, stale) => {
                        let frame = match render(&msg, stale) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("session {id}: serialize failed: {e}");
                                continue;
                            }
                        };
                        if write.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    PopResult::Empty => queue.notify.notified().await,
                    PopResult::Closed => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    };

    let reader = async move {
        // Dashboards only listen; we just watch for the close.
        while let Some(Ok(msg)) = read.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
        _ = shutdown.cancelled() => {}
    }

    queue.close();
    hub.sessions.remove(&id);
    METRICS.subscriber_sessions.fetch_sub(1, Ordering::Relaxed);
    log::info!("dashboard session {id} closed");
}

/// Serializes an event, tacking on `"stale": true` when the session
/// overflowed since the last write.
fn render(msg: &DashboardMessage, stale: bool) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(msg)?;
    if stale {
        if let Some(obj) = value.as_object_mut() {
            obj.insert("stale".to_string(), serde_json::Value::Bool(true));
        }
    }
    serde_json::to_string(&value)
}
