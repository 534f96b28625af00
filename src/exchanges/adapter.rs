use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::config::VenueConfig;
use crate::schema::Exchange;

/// Which half of a book a frame carries, for venues that stream the
/// two sides on separate channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bids,
    Asks,
}

/// Everything a raw frame can decode into.
///
/// Adapters translate; the collector runtime owns all state. A frame
/// that is neither data nor an ack (server banners, unsupported
/// channels) is `Control` and silently dropped.
#[derive(Debug)]
pub enum ParsedFrame {
    /// Infrastructure chatter; ignore.
    Control,

    /// The venue acknowledged one of our subscriptions.
    SubAck,

    /// Heartbeat that requires this exact text answer, now. The
    /// runner must send it before the venue's reply deadline.
    Reply(String),

    /// Full book for one market, tagged with its update id.
    Snapshot {
        native: String,
        last_update_id: u64,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    },

    /// Incremental update; id continuity is enforced by the book.
    Diff {
        native: String,
        id: u64,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    },

    /// Complete replacement of one side of one market's book.
    SideReplace {
        native: String,
        side: BookSide,
        levels: Vec<(Decimal, Decimal)>,
    },

    /// The frame was malformed or the venue reported an error.
    Error(String),
}

/// ExchangeAdapter is the abstraction layer between:
/// - The generic collector runtime
/// - Venue-specific WebSocket protocols
///
/// Each venue implementation must:
/// - Describe its framing quirks (compression, heartbeat deadline)
/// - Build handshake and subscription messages
/// - Parse raw frames into `ParsedFrame`
///
/// DESIGN GOALS:
/// - Zero venue-specific logic outside adapters
/// - One adapter per venue
/// - No I/O and no mutable state in adapters; the runtime owns
///   connections, orderbooks and sequencing
///
/// THREAD SAFETY:
/// - Must be Send + Sync; adapter instances are shared across tasks.
#[async_trait::async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Full WebSocket URL (wss://…), no query parameters.
    fn ws_url(&self) -> &'static str;

    /// Whether payload frames arrive as gzip-compressed binary.
    fn compressed_frames(&self) -> bool {
        false
    }

    /// How long the venue tolerates silence after its ping before it
    /// drops us. The runtime answers `Reply` frames immediately; this
    /// deadline also bounds the idle-read timeout.
    fn heartbeat_deadline(&self) -> Duration;

    /// Venue cap on subscriptions per socket. The runtime shards the
    /// subscription set into connections of at most this size.
    fn max_topics_per_socket(&self) -> usize {
        usize::MAX
    }

    /// Venue cap on sockets per source address. Exceeding it is a
    /// configuration problem, reported at startup.
    fn max_sockets(&self) -> usize {
        usize::MAX
    }

    /// Messages sent immediately after the socket opens, before any
    /// subscription (e.g. a protocol-level connect envelope).
    fn handshake_messages(&self) -> Vec<String> {
        Vec::new()
    }

    /// Subscription frames for a set of native symbols.
    ///
    /// MUST NOT perform network I/O or mutate shared state.
    fn subscribe_messages(&self, natives: &[String], cfg: &VenueConfig) -> Vec<String>;

    /// How many `SubAck`s to expect before the stream counts as
    /// established. Venues that never ack return 0; the runtime then
    /// waits for the first data frame instead.
    fn expected_acks(&self, natives: &[String], cfg: &VenueConfig) -> usize {
        self.subscribe_messages(natives, cfg).len()
    }

    /// Parses one text frame (already inflated if the venue
    /// compresses).
    ///
    /// IMPORTANT:
    /// - Must never panic; malformed input becomes `Error`.
    /// - Called on every incoming frame; allocation-aware.
    fn parse_frame(&self, raw: &str) -> ParsedFrame;

    /// Out-of-band seeding performed once per connection, after
    /// subscribing. Venues whose stream only carries deltas from
    /// "now" fetch their starting state here (REST).
    async fn bootstrap(
        &self,
        _natives: &[String],
        _cfg: &VenueConfig,
    ) -> anyhow::Result<Vec<ParsedFrame>> {
        Ok(Vec::new())
    }
}

/// Decimal out of a JSON string or number. Venues disagree on which
/// they send, sometimes within one message.
pub(crate) fn parse_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => decimal_from_str(s),
        Value::Number(n) => decimal_from_str(&n.to_string()),
        _ => None,
    }
}

fn decimal_from_str(s: &str) -> Option<Decimal> {
    s.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

/// `[[price, volume, ...], ...]` into level tuples, skipping rows
/// that do not parse. Extra tuple elements are venue noise.
pub(crate) fn parse_levels(v: &Value) -> Vec<(Decimal, Decimal)> {
    let Some(rows) = v.as_array() else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let row = row.as_array()?;
            let price = parse_decimal(row.first()?)?;
            let volume = parse_decimal(row.get(1)?)?;
            Some((price, volume))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn decimals_from_strings_and_numbers() {
        assert_eq!(parse_decimal(&json!("2001.5")), Some(dec!(2001.5)));
        assert_eq!(parse_decimal(&json!(42)), Some(dec!(42)));
        assert_eq!(parse_decimal(&json!(0.25)), Some(dec!(0.25)));
        assert_eq!(parse_decimal(&json!("1e-7")), Some(dec!(0.0000001)));
        assert_eq!(parse_decimal(&json!(null)), None);
        assert_eq!(parse_decimal(&json!("pear")), None);
    }

    #[test]
    fn levels_skip_malformed_rows() {
        let levels = parse_levels(&json!([
            ["2000", "1.5"],
            ["not-a-price", "1"],
            ["1999", "2", "extra", "fields"],
            "scalar-row"
        ]));
        assert_eq!(levels, vec![(dec!(2000), dec!(1.5)), (dec!(1999), dec!(2))]);
    }
}
