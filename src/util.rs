/// Shared helper utilities.
///
/// This module contains:
/// - Time helpers
/// - Gzip frame inflation
///
/// IMPORTANT:
/// - No exchange-specific business logic should live here.
/// - This module must remain lightweight and deterministic.
///
/// Exchange-specific behavior belongs in the adapter implementations.

use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;

/// Returns the current Unix timestamp in fractional seconds.
///
/// PANIC:
/// - Panics if system time is before UNIX_EPOCH (should never happen).
///
/// Used as the ingestion instant stamped onto every quote.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before UNIX_EPOCH")
        .as_secs_f64()
}

/// Inflates a gzip-compressed binary frame into UTF-8 text.
///
/// Some venues compress every payload frame. The collector runtime
/// calls this for binary frames before handing the text to the
/// adapter's parser.
///
/// RETURNS:
/// - `None` for invalid gzip or non-UTF-8 content. The caller drops
///   the frame and bumps the decode counter; the orderbook is never
///   desynced by a bad frame.
pub fn inflate_gzip(frame: &[u8]) -> Option<String> {
    let mut decoder = GzDecoder::new(frame);
    let mut out = String::new();
    decoder.read_to_string(&mut out).ok()?;
    Some(out)
}
