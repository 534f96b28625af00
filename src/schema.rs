use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The venues this process knows how to collect.
///
/// The string forms are stable identifiers: they appear in the markets
/// metadata, in configuration, in every outgoing dashboard event and in
/// log lines. Adding a venue means adding a variant here plus an
/// adapter module under `exchanges/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Bingx,
    Wallex,
    Ramzinex,
}

impl Exchange {
    pub fn all() -> [Exchange; 3] {
        [Exchange::Bingx, Exchange::Wallex, Exchange::Ramzinex]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Bingx => "bingx",
            Exchange::Wallex => "wallex",
            Exchange::Ramzinex => "ramzinex",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bingx" => Ok(Exchange::Bingx),
            "wallex" => Ok(Exchange::Wallex),
            "ramzinex" => Ok(Exchange::Ramzinex),
            _ => Err(ConfigError::UnknownExchange(s.to_string())),
        }
    }
}

/// Top-of-book snapshot for one (exchange, canonical pair).
///
/// Exactly one of these lives in the store per key; replacement is
/// conditional on `sequence` strictly increasing.
///
/// Prices and volumes are decimals end to end. No floats touch the
/// money path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub exchange: Exchange,

    /// Canonical pair, `BASE/QUOTE` uppercased (e.g. "ETH/USDT").
    pub pair: String,

    pub bid_price: Decimal,
    pub bid_volume: Decimal,
    pub ask_price: Decimal,
    pub ask_volume: Decimal,

    /// Ingestion instant, Unix seconds with fractional part.
    pub timestamp: f64,

    /// Monotonically non-decreasing per (exchange, pair).
    /// Used to reject reordered updates.
    pub sequence: u64,
}

/// A quote as dashboard sessions see it: the hub stamps symbol
/// metadata on so every event is self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireQuote {
    pub exchange: Exchange,
    pub symbol: String,
    pub display_symbol: String,
    pub base_currency: String,
    pub currency_name: String,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub bid_volume: Decimal,
    pub ask_volume: Decimal,
    pub timestamp: f64,
}

/// A detected arbitrage edge: buy at `buy_exchange`'s ask, sell at
/// `sell_exchange`'s bid, for the same canonical pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    /// Canonical pair; serialized as `symbol` for client display.
    #[serde(rename = "symbol")]
    pub pair: String,

    pub buy_exchange: Exchange,
    pub sell_exchange: Exchange,

    /// Ask on the buy venue.
    pub buy_price: Decimal,
    /// Bid on the sell venue.
    pub sell_price: Decimal,

    /// Top-of-book volumes available at the used prices.
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,

    /// min(buy_volume, sell_volume): the executable size at these tops.
    pub trade_volume: Decimal,

    /// (sell_price - buy_price) / buy_price * 100.
    pub profit_percentage: Decimal,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    /// Stable identity across repeat detections.
    pub fingerprint: String,

    /// Incremented on every repeat detection of the same fingerprint.
    pub seen_count: u64,
}

impl Opportunity {
    /// Builds an opportunity from two counter-side tops.
    ///
    /// CONTRACT:
    /// - The caller has already established `sell_price > buy_price`
    ///   and the minimum-profit threshold; this constructor only
    ///   derives the dependent fields.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: String,
        buy_exchange: Exchange,
        sell_exchange: Exchange,
        buy_price: Decimal,
        sell_price: Decimal,
        buy_volume: Decimal,
        sell_volume: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let trade_volume = buy_volume.min(sell_volume);
        let profit_percentage = (sell_price - buy_price) / buy_price * dec!(100);
        let fingerprint = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            buy_exchange,
            sell_exchange,
            pair,
            fp_component(buy_price, 10),
            fp_component(sell_price, 10),
            fp_component(buy_volume, 8),
            fp_component(sell_volume, 8),
        );

        Self {
            pair,
            buy_exchange,
            sell_exchange,
            buy_price,
            sell_price,
            buy_volume,
            sell_volume,
            trade_volume,
            profit_percentage,
            first_seen: now,
            last_seen: now,
            fingerprint,
            seen_count: 1,
        }
    }

    /// Repeat detection of the same fingerprint.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.seen_count += 1;
    }
}

/// One fingerprint component: rounded to `dp` places, trailing zeros
/// stripped so equal values always render identically.
fn fp_component(value: Decimal, dp: u32) -> String {
    value.round_dp(dp).normalize().to_string()
}

/// Aggregate counters sent to dashboard sessions every stats tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub prices_count: usize,
    pub opportunities_count: usize,
    pub best_profit_percentage: Option<Decimal>,
    pub uptime_seconds: i64,

    pub ws_connections_active: usize,
    pub ws_reconnects: usize,
    pub decode_errors: usize,
    pub protocol_errors: usize,
    pub sequence_gaps: usize,
    pub stale_quotes_rejected: usize,
    pub conflation_drops: usize,
    pub opportunities_detected: usize,
    pub opportunities_expired: usize,
    pub subscriber_sessions: usize,
    pub session_events_dropped: usize,
}

/// Every frame a dashboard session can receive.
///
/// The `type` / `data` envelope is part of the client contract; the
/// serde tagging below must not change without a dashboard release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DashboardMessage {
    InitialPrices(Vec<WireQuote>),
    PriceUpdate(WireQuote),
    InitialOpportunities(Vec<Opportunity>),
    OpportunitiesUpdate(Vec<Opportunity>),
    BestOpportunityUpdate(Option<Opportunity>),
    RedisStats(Stats),
}

impl DashboardMessage {
    /// Best updates are never dropped and never queue behind bulk data.
    pub fn is_best_update(&self) -> bool {
        matches!(self, DashboardMessage::BestOpportunityUpdate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opp(buy: Decimal, sell: Decimal, bv: Decimal, sv: Decimal) -> Opportunity {
        Opportunity::new(
            "ETH/USDT".to_string(),
            Exchange::Bingx,
            Exchange::Ramzinex,
            buy,
            sell,
            bv,
            sv,
            Utc::now(),
        )
    }

    #[test]
    fn profit_and_trade_volume() {
        let o = opp(dec!(2001), dec!(2010), dec!(10), dec!(5));
        assert_eq!(o.trade_volume, dec!(5));
        // (2010 - 2001) / 2001 * 100
        assert_eq!(o.profit_percentage.round_dp(4), dec!(0.4498));
    }

    #[test]
    fn fingerprint_ignores_trailing_zeros() {
        let a = opp(dec!(2001), dec!(2010), dec!(10), dec!(5));
        let b = opp(dec!(2001.00), dec!(2010.0), dec!(10.000), dec!(5.0));
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn fingerprint_distinguishes_direction() {
        let a = opp(dec!(2001), dec!(2010), dec!(10), dec!(5));
        let reversed = Opportunity::new(
            a.pair.clone(),
            a.sell_exchange,
            a.buy_exchange,
            a.buy_price,
            a.sell_price,
            a.buy_volume,
            a.sell_volume,
            a.first_seen,
        );
        assert_ne!(a.fingerprint, reversed.fingerprint);
    }

    #[test]
    fn dashboard_envelope_shape() {
        let msg = DashboardMessage::BestOpportunityUpdate(None);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "best_opportunity_update");
        assert!(v["data"].is_null());

        let msg = DashboardMessage::InitialPrices(vec![]);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "initial_prices");
        assert!(v["data"].as_array().unwrap().is_empty());
    }

    #[test]
    fn exchange_round_trip() {
        for ex in Exchange::all() {
            assert_eq!(ex.as_str().parse::<Exchange>().unwrap(), ex);
        }
        assert!("nasdaq".parse::<Exchange>().is_err());
    }
}
