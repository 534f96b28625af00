use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use once_cell::sync::Lazy;

/// Global runtime metrics for the pipeline.
///
/// Purpose:
/// - Track WebSocket connections and reconnects
/// - Track frame decode / protocol failures per the error policy
/// - Track store rejections and conflation drops
/// - Track detection throughput and subscriber pressure
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
///
/// Every counter here is surfaced to dashboard sessions through the
/// periodic stats event and to operators through periodic INFO lines.
#[derive(Default)]
pub struct RuntimeMetrics {
    // WebSocket level
    pub ws_connections_active: AtomicUsize,
    pub ws_reconnects: AtomicUsize,

    // Frame level
    pub frames_received: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub protocol_errors: AtomicUsize,
    pub sequence_gaps: AtomicUsize,
    pub unknown_symbols: AtomicUsize,

    // Store level
    pub quotes_accepted: AtomicUsize,
    pub stale_quotes_rejected: AtomicUsize,

    // Detector level
    pub conflation_drops: AtomicUsize,
    pub opportunities_detected: AtomicUsize,
    pub opportunities_expired: AtomicUsize,

    // Hub level
    pub subscriber_sessions: AtomicUsize,
    pub session_events_dropped: AtomicUsize,

    // Mirror level
    pub mirror_write_errors: AtomicUsize,
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
