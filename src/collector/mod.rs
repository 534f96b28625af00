/// Collector module
///
/// This module groups all logic responsible for:
/// - Starting venue collectors
/// - Managing WebSocket lifecycles per venue
/// - Feeding normalized quotes into the top-of-book store
///
/// The collector layer is the orchestration layer between:
/// - Exchange adapters (bingx, wallex, ramzinex)
/// - The shared store (input to detection and broadcast)
///
/// Design notes:
/// - Venue-specific logic MUST NOT live here
/// - Adapters translate protocol; this layer owns sockets, orderbook
///   state, sequencing, backoff and stale marking
pub mod runner;

pub use runner::run_exchange;
