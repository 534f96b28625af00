use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::{Value, json};

use crate::config::VenueConfig;
use crate::schema::Exchange;

use super::adapter::{BookSide, ExchangeAdapter, ParsedFrame, parse_decimal};

/// Wallex WebSocket adapter (spot depth channels).
///
/// Framing is array-based: both directions are two-element JSON
/// arrays. We send `["subscribe", {"channel": "<SYMBOL>@buyDepth"}]`
/// and the venue pushes `["<SYMBOL>@buyDepth", [levels...]]`.
///
/// Each channel carries exactly one side of the book as a complete
/// list of `{price, quantity, sum}` objects, so a full Quote needs
/// both the buyDepth and sellDepth channels of a symbol.
///
/// There is no subscribe ack; the stream counts as established on the
/// first data frame. The websocket stream also starts empty until the
/// book changes, so the initial state is seeded over REST.
///
/// NOTE:
/// - Upstream sample code shows a channel name prefixed with a stray
///   U+064E diacritic. Whether it is significant is unconfirmed with
///   the venue, so incoming channel names are matched after stripping
///   any leading non-alphanumeric characters, which accepts both
///   spellings.
pub struct WallexAdapter;

const REST_DEPTH_URL: &str = "https://api.wallex.ir/v1/depth";

fn object_levels(v: &Value) -> Vec<(Decimal, Decimal)> {
    let Some(rows) = v.as_array() else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let price = parse_decimal(row.get("price")?)?;
            let quantity = parse_decimal(row.get("quantity")?)?;
            Some((price, quantity))
        })
        .collect()
}

#[async_trait::async_trait]
impl ExchangeAdapter for WallexAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Wallex
    }

    fn ws_url(&self) -> &'static str {
        "wss://api.wallex.ir/ws"
    }

    fn heartbeat_deadline(&self) -> Duration {
        // No protocol-level ping; the idle-read deadline does the work.
        Duration::from_secs(30)
    }

    fn subscribe_messages(&self, natives: &[String], _cfg: &VenueConfig) -> Vec<String> {
        natives
            .iter()
            .flat_map(|native| {
                [
                    json!(["subscribe", { "channel": format!("{native}@buyDepth") }]).to_string(),
                    json!(["subscribe", { "channel": format!("{native}@sellDepth") }]).to_string(),
                ]
            })
            .collect()
    }

    fn expected_acks(&self, _natives: &[String], _cfg: &VenueConfig) -> usize {
        0
    }

    fn parse_frame(&self, raw: &str) -> ParsedFrame {
        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return ParsedFrame::Error(format!("bad json: {e}")),
        };

        let Some(frame) = v.as_array() else {
            // Status objects and server banners.
            return ParsedFrame::Control;
        };
        let (Some(channel), Some(payload)) =
            (frame.first().and_then(Value::as_str), frame.get(1))
        else {
            return ParsedFrame::Control;
        };

        // See the module note on the stray channel-name prefix.
        let channel = channel.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());

        let Some((native, kind)) = channel.split_once('@') else {
            return ParsedFrame::Control;
        };
        let side = match kind {
            "buyDepth" => BookSide::Bids,
            "sellDepth" => BookSide::Asks,
            _ => return ParsedFrame::Control,
        };

        ParsedFrame::SideReplace {
            native: native.to_string(),
            side,
            levels: object_levels(payload),
        }
    }

    /// Seeds both sides of every subscribed symbol from the REST depth
    /// endpoint, so quotes flow before the first websocket push.
    async fn bootstrap(
        &self,
        natives: &[String],
        _cfg: &VenueConfig,
    ) -> anyhow::Result<Vec<ParsedFrame>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let mut frames = Vec::with_capacity(natives.len() * 2);
        for native in natives {
            let body: Value = client
                .get(REST_DEPTH_URL)
                .query(&[("symbol", native.as_str())])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let result = &body["result"];
            frames.push(ParsedFrame::SideReplace {
                native: native.clone(),
                side: BookSide::Bids,
                levels: object_levels(&result["bid"]),
            });
            frames.push(ParsedFrame::SideReplace {
                native: native.clone(),
                side: BookSide::Asks,
                levels: object_levels(&result["ask"]),
            });
        }
        Ok(frames)
    }
}
