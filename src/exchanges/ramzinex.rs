use std::time::Duration;

use serde_json::{Value, json};

use crate::config::VenueConfig;
use crate::schema::Exchange;

use super::adapter::{ExchangeAdapter, ParsedFrame, parse_levels};

/// Ramzinex WebSocket adapter (Centrifugo-based).
///
/// Bidirectional JSON envelopes:
/// - client: `{"connect": {...}, "id": 1}`, then one
///   `{"subscribe": {"channel": "orderbook:<pair_id>"}, "id": n}` per
///   market. Pair ids are the venue's opaque numeric identifiers; the
///   symbol registry maps them like any other native symbol.
/// - server: replies echo the id; book pushes arrive as
///   `{"push": {"channel": ..., "pub": {"data": ..., "offset": n}}}`.
/// - ping is an empty `{}`; the client must answer `{}` within 25 s.
///
/// Each push carries the full book as sorted `buys`/`sells` arrays of
/// `[price, amount, ...]` tuples. The channel also offers a fossil
/// delta mode; we subscribe without it and take full pushes, so a
/// parse arm producing `Diff` frames is all a later switch needs.
pub struct RamzinexAdapter;

#[async_trait::async_trait]
impl ExchangeAdapter for RamzinexAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Ramzinex
    }

    fn ws_url(&self) -> &'static str {
        "wss://websocket.ramzinex.com/websocket"
    }

    fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(25)
    }

    fn handshake_messages(&self) -> Vec<String> {
        vec![json!({ "connect": { "name": "js" }, "id": 1 }).to_string()]
    }

    fn subscribe_messages(&self, natives: &[String], _cfg: &VenueConfig) -> Vec<String> {
        natives
            .iter()
            .enumerate()
            .map(|(i, pair_id)| {
                json!({
                    "subscribe": { "channel": format!("orderbook:{pair_id}") },
                    "id": i + 2,
                })
                .to_string()
            })
            .collect()
    }

    fn parse_frame(&self, raw: &str) -> ParsedFrame {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return ParsedFrame::Error(format!("bad json: {e}")),
        };

        let Some(obj) = v.as_object() else {
            return ParsedFrame::Control;
        };

        // Server ping: empty object, answered in kind.
        if obj.is_empty() {
            return ParsedFrame::Reply("{}".to_string());
        }

        if obj.contains_key("error") {
            return ParsedFrame::Error(v["error"].to_string());
        }

        // Reply to one of our subscribe requests.
        if obj.contains_key("subscribe") && obj.contains_key("id") {
            return ParsedFrame::SubAck;
        }

        let Some(push) = obj.get("push") else {
            // Connect replies and other envelope chatter.
            return ParsedFrame::Control;
        };

        let Some(channel) = push.get("channel").and_then(Value::as_str) else {
            return ParsedFrame::Error("push without channel".to_string());
        };
        let Some(pair_id) = channel.strip_prefix("orderbook:") else {
            return ParsedFrame::Control;
        };

        let publication = &push["pub"];
        let data = &publication["data"];
        let bids = parse_levels(&data["buys"]);
        let asks = parse_levels(&data["sells"]);
        if bids.is_empty() && asks.is_empty() {
            return ParsedFrame::Error(format!("empty book push on {channel}"));
        }

        // Channel offset orders pushes; absent on some deployments,
        // in which case the runner falls back to its own counter.
        let offset = publication.get("offset").and_then(Value::as_u64).unwrap_or(0);

        ParsedFrame::Snapshot {
            native: pair_id.to_string(),
            last_update_id: offset,
            bids,
            asks,
        }
    }
}
