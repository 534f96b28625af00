use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::VenueConfig;
use crate::schema::Exchange;

use super::adapter::{ExchangeAdapter, ParsedFrame, parse_levels};

/// BingX WebSocket adapter (swap market stream).
///
/// Framing:
/// - Every payload frame is gzip-compressed JSON in a binary frame;
///   the runtime inflates before calling `parse_frame`.
/// - The server sends a literal text `"Ping"` roughly every 5 s and
///   drops the socket if `"Pong"` does not come back before the next
///   tick.
///
/// Subscriptions are one topic per request, uuid-tagged, acked with
/// the same id and `code == 0`.
///
/// Venue limits: 200 topics per socket, 60 sockets per source IP.
pub struct BingxAdapter;

#[async_trait::async_trait]
impl ExchangeAdapter for BingxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bingx
    }

    fn ws_url(&self) -> &'static str {
        "wss://open-api-ws.bingx.com/market"
    }

    fn compressed_frames(&self) -> bool {
        true
    }

    fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn max_topics_per_socket(&self) -> usize {
        200
    }

    fn max_sockets(&self) -> usize {
        60
    }

    fn subscribe_messages(&self, natives: &[String], _cfg: &VenueConfig) -> Vec<String> {
        natives
            .iter()
            .map(|native| {
                json!({
                    "id": Uuid::new_v4().to_string(),
                    "reqType": "sub",
                    "dataType": format!("{native}@incrDepth"),
                })
                .to_string()
            })
            .collect()
    }

    fn parse_frame(&self, raw: &str) -> ParsedFrame {
        if raw == "Ping" {
            return ParsedFrame::Reply("Pong".to_string());
        }

        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return ParsedFrame::Error(format!("bad json: {e}")),
        };

        // Subscription ack: {"id": "<uuid>", "code": 0, "msg": ""}
        if let Some(code) = v.get("code").and_then(Value::as_i64) {
            if code == 0 {
                return ParsedFrame::SubAck;
            }
            let msg = v.get("msg").and_then(Value::as_str).unwrap_or("");
            return ParsedFrame::Error(format!("subscribe rejected: code={code} {msg}"));
        }

        let Some(data_type) = v.get("dataType").and_then(Value::as_str) else {
            return ParsedFrame::Control;
        };
        let Some((native, channel)) = data_type.split_once('@') else {
            return ParsedFrame::Control;
        };
        if channel != "incrDepth" {
            return ParsedFrame::Control;
        }

        let data = &v["data"];
        let Some(id) = data.get("lastUpdateId").and_then(Value::as_u64) else {
            return ParsedFrame::Error("incrDepth without lastUpdateId".to_string());
        };
        let bids = parse_levels(&data["bids"]);
        let asks = parse_levels(&data["asks"]);

        // The first push after subscribing carries the whole book.
        if data.get("action").and_then(Value::as_str) == Some("all") {
            ParsedFrame::Snapshot {
                native: native.to_string(),
                last_update_id: id,
                bids,
                asks,
            }
        } else {
            ParsedFrame::Diff {
                native: native.to_string(),
                id,
                bids,
                asks,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg() -> VenueConfig {
        VenueConfig::for_tests("bingx")
    }

    #[test]
    fn ping_gets_pong() {
        match BingxAdapter.parse_frame("Ping") {
            ParsedFrame::Reply(r) => assert_eq!(r, "Pong"),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn one_uuid_tagged_request_per_topic() {
        let msgs = BingxAdapter.subscribe_messages(
            &["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            &cfg(),
        );
        assert_eq!(msgs.len(), 2);
        let v: Value = serde_json::from_str(&msgs[1]).unwrap();
        assert_eq!(v["reqType"], "sub");
        assert_eq!(v["dataType"], "ETH-USDT@incrDepth");
        assert!(Uuid::parse_str(v["id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn ack_and_rejection() {
        let ack = r#"{"id":"4e9c9a28-8e37-4a4c-8a7d-0a1b2c3d4e5f","code":0,"msg":""}"#;
        assert!(matches!(BingxAdapter.parse_frame(ack), ParsedFrame::SubAck));

        let rejected = r#"{"id":"4e9c9a28-8e37-4a4c-8a7d-0a1b2c3d4e5f","code":100400,"msg":"bad dataType"}"#;
        assert!(matches!(
            BingxAdapter.parse_frame(rejected),
            ParsedFrame::Error(_)
        ));
    }

    #[test]
    fn snapshot_then_diff() {
        let snap = r#"{
            "dataType": "ETH-USDT@incrDepth",
            "data": {
                "action": "all",
                "lastUpdateId": 100,
                "bids": [["2000", "10"], ["1999", "4"]],
                "asks": [["2001", "8"]]
            }
        }"#;
        match BingxAdapter.parse_frame(snap) {
            ParsedFrame::Snapshot {
                native,
                last_update_id,
                bids,
                asks,
            } => {
                assert_eq!(native, "ETH-USDT");
                assert_eq!(last_update_id, 100);
                assert_eq!(bids[0], (dec!(2000), dec!(10)));
                assert_eq!(asks.len(), 1);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        let diff = r#"{
            "dataType": "ETH-USDT@incrDepth",
            "data": {
                "action": "update",
                "lastUpdateId": 101,
                "bids": [["2000", "0"]],
                "asks": []
            }
        }"#;
        match BingxAdapter.parse_frame(diff) {
            ParsedFrame::Diff { id, bids, .. } => {
                assert_eq!(id, 101);
                assert_eq!(bids[0].1, dec!(0));
            }
            other => panic!("expected diff, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_channels_are_control() {
        let trade = r#"{"dataType":"ETH-USDT@trade","data":{}}"#;
        assert!(matches!(BingxAdapter.parse_frame(trade), ParsedFrame::Control));
        assert!(matches!(
            BingxAdapter.parse_frame("not json"),
            ParsedFrame::Error(_)
        ));
    }
}
