use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::VenueConfig;
use crate::error::CollectorError;
use crate::exchanges::adapter::{BookSide, ExchangeAdapter, ParsedFrame};
use crate::metrics::METRICS;
use crate::orderbook::{ApplyOutcome, BookDiff, OrderBook};
use crate::schema::{Exchange, Quote};
use crate::store::TopOfBookStore;
use crate::symbols::SymbolRegistry;
use crate::util;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Streaming at least this long counts as a healthy session and
/// resets the backoff.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(30);

/// More decode/protocol errors than this within one minute cycles the
/// connection instead of limping on.
const ERROR_RATE_LIMIT: u32 = 5;
const ERROR_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Store sequence for venues that publish no book id of their own.
/// Process-wide and strictly increasing, so per-key monotonicity
/// holds across reconnects too.
static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exponential reconnect backoff with jitter.
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: BACKOFF_START,
        }
    }

    /// Next delay: current step plus up to 50% jitter, then doubles
    /// the step up to the cap.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(BACKOFF_CAP);
        let jitter_ms = rand::random_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }

    fn reset(&mut self) {
        self.current = BACKOFF_START;
    }
}

/// Decode/protocol error budget per connection.
struct ErrorWindow {
    start: Instant,
    count: u32,
}

impl ErrorWindow {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            count: 0,
        }
    }

    /// Records one error; true means the budget is blown and the
    /// connection should cycle.
    fn record(&mut self) -> bool {
        if self.start.elapsed() > ERROR_RATE_WINDOW {
            self.start = Instant::now();
            self.count = 0;
        }
        self.count += 1;
        self.count > ERROR_RATE_LIMIT
    }
}

/// Greedy sharding of a venue's topics across sockets.
///
/// Topics fill each socket up to the smaller of the operator's
/// per-connection setting and the venue's own cap; sockets beyond the
/// venue's socket cap (or the global `MAX_CONNECTIONS`) are cut, and
/// the cut topics reported.
fn shard_topics(
    natives: &[String],
    per_connection: usize,
    venue_topic_cap: usize,
    socket_cap: usize,
) -> (Vec<Vec<String>>, usize) {
    let chunk = per_connection.max(1).min(venue_topic_cap);
    let mut shards: Vec<Vec<String>> = natives.chunks(chunk).map(<[String]>::to_vec).collect();
    let mut dropped = 0;
    while shards.len() > socket_cap {
        dropped += shards.pop().map(|s| s.len()).unwrap_or(0);
    }
    (shards, dropped)
}

/// Starts all collectors for a single venue.
///
/// One venue → one socket per topic shard; each socket runs an
/// independent reconnect loop. Failures are isolated per connection.
pub async fn run_exchange(
    adapter: Arc<dyn ExchangeAdapter>,
    cfg: VenueConfig,
    max_connections: usize,
    registry: Arc<SymbolRegistry>,
    store: Arc<TopOfBookStore>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let exchange = adapter.exchange();
    let natives: Vec<String> = registry
        .for_exchange(exchange)
        .iter()
        .map(|(native, _)| native.clone())
        .collect();

    if natives.is_empty() {
        log::warn!("{exchange}: no enabled markets in the registry, not starting");
        return Ok(());
    }

    let socket_cap = adapter.max_sockets().min(max_connections);
    let (shards, dropped) = shard_topics(
        &natives,
        cfg.topics_per_connection,
        adapter.max_topics_per_socket(),
        socket_cap,
    );
    if dropped > 0 {
        log::error!(
            "{exchange}: {dropped} topics exceed the {socket_cap}-socket cap and will not be collected"
        );
    }

    log::info!(
        "{exchange}: starting {} connection(s) for {} topics",
        shards.len(),
        natives.len() - dropped
    );

    for shard in shards {
        tokio::spawn(run_ws_loop(
            adapter.clone(),
            shard,
            cfg.clone(),
            registry.clone(),
            store.clone(),
            shutdown.clone(),
        ));
    }

    Ok(())
}

/// Persistent reconnect loop for one socket shard.
///
/// State machine per connection:
/// DISCONNECTED → CONNECTING → HANDSHAKING → SUBSCRIBING → STREAMING,
/// any failure → RECONNECT_BACKOFF → CONNECTING, cancellation →
/// SHUTDOWN.
async fn run_ws_loop(
    adapter: Arc<dyn ExchangeAdapter>,
    natives: Vec<String>,
    cfg: VenueConfig,
    registry: Arc<SymbolRegistry>,
    store: Arc<TopOfBookStore>,
    shutdown: CancellationToken,
) {
    let exchange = adapter.exchange();
    let grace = Duration::from_secs(cfg.grace_secs);
    let mut backoff = Backoff::new();
    let mut down_since = Instant::now();
    // Nothing to exclude from detection until we have streamed once.
    let mut marked_stale = true;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        // CONNECTING
        let connected = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = timeout(CONNECT_TIMEOUT, connect_async(adapter.ws_url())) => res,
        };

        match connected {
            Ok(Ok((ws, _))) => {
                METRICS.ws_connections_active.fetch_add(1, Ordering::Relaxed);
                let mut streaming_started = None;
                let ended = run_session(
                    adapter.as_ref(),
                    &natives,
                    &cfg,
                    &registry,
                    &store,
                    &shutdown,
                    ws,
                    &mut streaming_started,
                )
                .await;
                METRICS.ws_connections_active.fetch_sub(1, Ordering::Relaxed);

                match ended {
                    // Clean cancellation; the socket was closed.
                    Ok(()) => return,
                    Err(e) => log::warn!("{exchange}: session ended: {e}"),
                }

                if let Some(started) = streaming_started {
                    if started.elapsed() >= BACKOFF_RESET_AFTER {
                        backoff.reset();
                    }
                    down_since = Instant::now();
                    marked_stale = false;
                }
            }
            Ok(Err(e)) => log::warn!("{exchange}: connect failed: {e}"),
            Err(_) => log::warn!("{exchange}: connect timed out"),
        }

        // RECONNECT_BACKOFF
        METRICS.ws_reconnects.fetch_add(1, Ordering::Relaxed);
        if !marked_stale && down_since.elapsed() >= grace {
            store.mark_exchange_stale(exchange);
            marked_stale = true;
        }

        let delay = backoff.next_delay();
        log::debug!("{exchange}: reconnecting in {delay:?}");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(delay) => {}
        }
        if !marked_stale && down_since.elapsed() >= grace {
            store.mark_exchange_stale(exchange);
            marked_stale = true;
        }
    }
}

/// One connection from handshake to its end.
///
/// Returns Ok(()) only for cooperative shutdown; every other ending
/// is an error the caller recovers from with backoff.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    adapter: &dyn ExchangeAdapter,
    natives: &[String],
    cfg: &VenueConfig,
    registry: &SymbolRegistry,
    store: &TopOfBookStore,
    shutdown: &CancellationToken,
    ws: WsStream,
    streaming_started: &mut Option<Instant>,
) -> Result<(), CollectorError> {
    let exchange = adapter.exchange();
    let (mut write, mut read) = ws.split();

    // HANDSHAKING
    for msg in adapter.handshake_messages() {
        write.send(Message::Text(msg.into())).await?;
    }

    // SUBSCRIBING
    for msg in adapter.subscribe_messages(natives, cfg) {
        write.send(Message::Text(msg.into())).await?;
    }
    let mut acks_needed = adapter.expected_acks(natives, cfg);
    let subscribe_deadline = Instant::now() + SUBSCRIBE_ACK_TIMEOUT;

    // Each native symbol owns one book for the life of the
    // connection; nothing outside this task ever touches it.
    let mut books: HashMap<String, OrderBook> = HashMap::new();

    // Venues whose stream starts at "now" seed their books here.
    match adapter.bootstrap(natives, cfg).await {
        Ok(frames) => {
            for frame in frames {
                apply_book_frame(frame, &mut books, exchange, registry, store);
            }
        }
        Err(e) => return Err(CollectorError::Protocol(format!("bootstrap: {e}"))),
    }

    let mut errors = ErrorWindow::new();
    // The venue heartbeats well inside this; silence means the
    // connection is dead even if TCP has not noticed.
    let idle_deadline = IDLE_READ_TIMEOUT.min(adapter.heartbeat_deadline() * 3);

    loop {
        let read_deadline = if streaming_started.is_some() {
            idle_deadline
        } else {
            let left = subscribe_deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(CollectorError::SubscribeTimeout(SUBSCRIBE_ACK_TIMEOUT));
            }
            left.min(idle_deadline)
        };

        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = timeout(read_deadline, read.next()) => frame,
        };

        let msg = match frame {
            Err(_) if streaming_started.is_some() => {
                return Err(CollectorError::HeartbeatTimeout(read_deadline));
            }
            Err(_) => return Err(CollectorError::SubscribeTimeout(SUBSCRIBE_ACK_TIMEOUT)),
            Ok(None) => return Err(CollectorError::Protocol("connection closed".to_string())),
            Ok(Some(Err(e))) => return Err(CollectorError::Transport(e)),
            Ok(Some(Ok(msg))) => msg,
        };

        METRICS.frames_received.fetch_add(1, Ordering::Relaxed);

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Binary(b) if adapter.compressed_frames() => {
                match util::inflate_gzip(&b) {
                    Some(t) => t,
                    None => {
                        METRICS.decode_errors.fetch_add(1, Ordering::Relaxed);
                        let err = CollectorError::Decode("bad gzip frame".to_string());
                        log::debug!("{exchange}: dropping frame: {err}");
                        if errors.record() {
                            return Err(CollectorError::Protocol(
                                "decode error rate exceeded".to_string(),
                            ));
                        }
                        continue;
                    }
                }
            }
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await?;
                continue;
            }
            // Unexpected binary, pongs, other frames: not ours.
            _ => continue,
        };

        match adapter.parse_frame(&text) {
            ParsedFrame::Control => {}

            ParsedFrame::SubAck => {
                if acks_needed > 0 {
                    acks_needed -= 1;
                    if acks_needed == 0 && streaming_started.is_none() {
                        note_streaming(streaming_started, store, exchange, natives.len());
                    }
                }
            }

            ParsedFrame::Reply(reply) => {
                // Heartbeat answer; the venue's deadline is short, so
                // this goes out before anything else.
                write.send(Message::Text(reply.into())).await?;
            }

            ParsedFrame::Error(e) => {
                METRICS.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("{exchange}: {e}");
                if errors.record() {
                    return Err(CollectorError::Protocol(
                        "protocol error rate exceeded".to_string(),
                    ));
                }
            }

            frame @ (ParsedFrame::Snapshot { .. }
            | ParsedFrame::Diff { .. }
            | ParsedFrame::SideReplace { .. }) => {
                if streaming_started.is_none() {
                    note_streaming(streaming_started, store, exchange, natives.len());
                }
                if let Some(native) = apply_book_frame(frame, &mut books, exchange, registry, store)
                {
                    // Continuity lost; a fresh subscribe re-snapshots
                    // this market.
                    for msg in adapter.subscribe_messages(std::slice::from_ref(&native), cfg) {
                        write.send(Message::Text(msg.into())).await?;
                    }
                }
            }
        }
    }
}

fn note_streaming(
    streaming_started: &mut Option<Instant>,
    store: &TopOfBookStore,
    exchange: Exchange,
    topics: usize,
) {
    *streaming_started = Some(Instant::now());
    store.mark_exchange_live(exchange);
    log::info!("{exchange}: streaming ({topics} topics)");
}

/// Applies one data frame to the connection's books and projects the
/// affected top of book into the store.
///
/// Returns the native symbol needing a resubscribe when diff
/// continuity could not be rebuilt.
fn apply_book_frame(
    frame: ParsedFrame,
    books: &mut HashMap<String, OrderBook>,
    exchange: Exchange,
    registry: &SymbolRegistry,
    store: &TopOfBookStore,
) -> Option<String> {
    match frame {
        ParsedFrame::Snapshot {
            native,
            last_update_id,
            bids,
            asks,
        } => {
            let book = books.entry(native.clone()).or_default();
            book.apply_snapshot(last_update_id, &bids, &asks);
            project_quote(exchange, &native, book, registry, store);
            None
        }

        ParsedFrame::Diff {
            native,
            id,
            bids,
            asks,
        } => {
            let book = books.entry(native.clone()).or_default();
            let expected = book.last_update_id() + 1;
            match book.apply_diff(BookDiff { id, bids, asks }) {
                ApplyOutcome::Applied => {
                    project_quote(exchange, &native, book, registry, store);
                    None
                }
                ApplyOutcome::Buffered | ApplyOutcome::Ignored => None,
                ApplyOutcome::Resync => {
                    METRICS.sequence_gaps.fetch_add(1, Ordering::Relaxed);
                    let gap = CollectorError::SequenceGap {
                        native: native.clone(),
                        expected,
                        got: id,
                    };
                    log::warn!("{exchange}: {gap}, resubscribing");
                    Some(native)
                }
            }
        }

        ParsedFrame::SideReplace {
            native,
            side,
            levels,
        } => {
            let book = books.entry(native.clone()).or_default();
            match side {
                BookSide::Bids => book.replace_bids(&levels),
                BookSide::Asks => book.replace_asks(&levels),
            }
            project_quote(exchange, &native, book, registry, store);
            None
        }

        // Non-data frames never reach here.
        _ => None,
    }
}

/// Projects the top of a book into the store as a Quote.
///
/// Skips half-filled books (only one side seen so far) and crossed
/// tops, which occur transiently mid-diff on some venues.
fn project_quote(
    exchange: Exchange,
    native: &str,
    book: &OrderBook,
    registry: &SymbolRegistry,
    store: &TopOfBookStore,
) {
    let (Some((bid_price, bid_volume)), Some((ask_price, ask_volume))) =
        (book.top_bid(), book.top_ask())
    else {
        return;
    };
    if ask_price < bid_price {
        log::debug!("{exchange}: crossed top on {native}, not projecting");
        return;
    }

    let Some(pair) = registry.canonicalize(exchange, native) else {
        METRICS.unknown_symbols.fetch_add(1, Ordering::Relaxed);
        log::debug!("{exchange}: dropping update for unknown symbol {native}");
        return;
    };

    let sequence = if book.last_update_id() > 0 {
        book.last_update_id()
    } else {
        FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed)
    };

    store.put(Quote {
        exchange,
        pair: pair.to_string(),
        bid_price,
        bid_volume,
        ask_price,
        ask_volume,
        timestamp: util::now_secs(),
        sequence,
    });
}
