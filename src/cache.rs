use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::metrics::METRICS;
use crate::schema::Opportunity;

/// A freshly inserted edge must beat the reigning best by this many
/// percentage points before the "best" pointer moves. Keeps two
/// near-equal edges from flapping the dashboard.
const BEST_EPSILON: Decimal = dec!(0.01);

/// What the cache tells the hub.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A fingerprint seen for the first time. Repeat detections
    /// refresh the entry silently.
    Inserted(Opportunity),
    /// The best opportunity changed (or expired away to None).
    BestChanged(Option<Opportunity>),
}

#[derive(Default)]
struct CacheInner {
    by_fingerprint: HashMap<String, Opportunity>,
    best: Option<Opportunity>,
}

/// Recent opportunities, deduplicated by fingerprint.
///
/// Single-writer: only the cache task calls `upsert`/`sweep`. Readers
/// (hub snapshots, the mirror) take point-in-time copies under a
/// short lock that is never held across an await.
pub struct OpportunityCache {
    inner: Mutex<CacheInner>,
}

impl Default for OpportunityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OpportunityCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Inserts a detection or refreshes the entry with its
    /// fingerprint. Returns the events the hub should publish.
    pub fn upsert(&self, opp: Opportunity) -> Vec<CacheEvent> {
        let mut inner = self.inner.lock().expect("opportunity cache poisoned");

        if let Some(existing) = inner.by_fingerprint.get_mut(&opp.fingerprint) {
            existing.refresh(opp.last_seen);
            let (last_seen, seen_count) = (existing.last_seen, existing.seen_count);
            // Equal fingerprints have equal profit, so a repeat can
            // never move the best pointer; just keep its copy fresh.
            if let Some(best) = inner.best.as_mut().filter(|b| b.fingerprint == opp.fingerprint) {
                best.last_seen = last_seen;
                best.seen_count = seen_count;
            }
            return Vec::new();
        }

        inner
            .by_fingerprint
            .insert(opp.fingerprint.clone(), opp.clone());
        let mut events = vec![CacheEvent::Inserted(opp.clone())];

        let dethroned = match &inner.best {
            None => true,
            Some(best) => opp.profit_percentage > best.profit_percentage + BEST_EPSILON,
        };
        if dethroned {
            inner.best = Some(opp.clone());
            events.push(CacheEvent::BestChanged(Some(opp)));
        }

        events
    }

    /// Drops entries idle past the TTL. If the best expired, rescans
    /// the survivors and reports the change.
    pub fn sweep(&self, ttl: TimeDelta, now: DateTime<Utc>) -> Option<CacheEvent> {
        let mut inner = self.inner.lock().expect("opportunity cache poisoned");

        let before = inner.by_fingerprint.len();
        inner.by_fingerprint.retain(|_, o| now - o.last_seen <= ttl);
        let expired = before - inner.by_fingerprint.len();
        if expired > 0 {
            METRICS.opportunities_expired.fetch_add(expired, Ordering::Relaxed);
        }

        let best_expired = inner
            .best
            .as_ref()
            .is_some_and(|b| !inner.by_fingerprint.contains_key(&b.fingerprint));
        if !best_expired {
            return None;
        }

        let new_best = select_best(inner.by_fingerprint.values());
        inner.best = new_best.clone();
        Some(CacheEvent::BestChanged(new_best))
    }

    /// Copy of every entry, most recently seen first. Used for the
    /// session-open snapshot.
    pub fn snapshot(&self) -> Vec<Opportunity> {
        let inner = self.inner.lock().expect("opportunity cache poisoned");
        let mut all: Vec<Opportunity> = inner.by_fingerprint.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all
    }

    pub fn best(&self) -> Option<Opportunity> {
        self.inner
            .lock()
            .expect("opportunity cache poisoned")
            .best
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("opportunity cache poisoned")
            .by_fingerprint
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Highest profit wins; equal profit falls back to the larger
/// executable size.
fn select_best<'a>(candidates: impl Iterator<Item = &'a Opportunity>) -> Option<Opportunity> {
    candidates
        .max_by(|a, b| {
            a.profit_percentage
                .cmp(&b.profit_percentage)
                .then(a.trade_volume.cmp(&b.trade_volume))
        })
        .cloned()
}

/// The single-writer cache task: consumes the detector stream,
/// sweeps on a timer, forwards events to the hub.
pub fn spawn(
    cache: Arc<OpportunityCache>,
    cfg: &CacheConfig,
    detections: mpsc::Receiver<Opportunity>,
    shutdown: CancellationToken,
) -> mpsc::Receiver<CacheEvent> {
    let (tx, rx) = mpsc::channel(256);
    let ttl = TimeDelta::seconds(cfg.ttl_secs as i64);
    let sweep_every = std::time::Duration::from_secs(cfg.sweep_interval_secs.max(1));
    tokio::spawn(run(cache, ttl, sweep_every, detections, tx, shutdown));
    rx
}

async fn run(
    cache: Arc<OpportunityCache>,
    ttl: TimeDelta,
    sweep_every: std::time::Duration,
    mut detections: mpsc::Receiver<Opportunity>,
    tx: mpsc::Sender<CacheEvent>,
    shutdown: CancellationToken,
) {
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,

            detection = detections.recv() => {
                let Some(opp) = detection else { return };
                for event in cache.upsert(opp) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            _ = sweep.tick() => {
                if let Some(event) = cache.sweep(ttl, Utc::now()) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
