use std::collections::HashMap;
use std::fs;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::schema::Exchange;

/// Display precision for one market.
#[derive(Debug, Clone, Deserialize)]
pub struct Precision {
    pub price: u32,
    pub amount: u32,
}

/// Canonical market identity plus the human-facing metadata persisted
/// alongside it.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolMetadata {
    /// `BASE/QUOTE`, uppercased. E.g. "ETH/USDT".
    pub canonical_id: String,
    pub base: String,
    pub quote: String,
    pub display_name: String,
    pub currency_name: String,
    pub precision: Precision,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct AliasRow {
    exchange: String,
    native_symbol: String,
    canonical_id: String,
}

/// On-disk shape of the markets metadata: a JSON export of the
/// `markets` and `exchange_aliases` tables of the operator database.
#[derive(Debug, Deserialize)]
struct MarketsFile {
    markets: Vec<SymbolMetadata>,
    exchange_aliases: Vec<AliasRow>,
}

/// Symbol registry: exchange-native identifiers to canonical pairs.
///
/// Loaded once at startup and immutable afterwards, so every read is
/// lock-free. Changing the market set requires a restart; the cost of
/// dynamic reconfiguration is not justified by operator needs.
///
/// One venue (ramzinex) keys its channels by opaque numeric pair ids.
/// Those ids are ordinary alias rows here; nothing downstream knows
/// the difference.
pub struct SymbolRegistry {
    markets: HashMap<String, SymbolMetadata>,
    aliases: HashMap<(Exchange, String), String>,
    by_exchange: HashMap<Exchange, Vec<(String, String)>>,
}

impl SymbolRegistry {
    /// Loads and validates the markets metadata file.
    ///
    /// Any structural problem (unparseable file, duplicate alias,
    /// alias pointing at a market that does not exist) is fatal:
    /// the process must not start on inconsistent metadata.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let file: MarketsFile =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;
        Self::build(file)
    }

    fn build(file: MarketsFile) -> Result<Self, ConfigError> {
        let mut markets = HashMap::new();
        for m in file.markets {
            if !m.canonical_id.contains('/') {
                return Err(ConfigError::BadMetadata(format!(
                    "canonical_id '{}' is not BASE/QUOTE",
                    m.canonical_id
                )));
            }
            if m.canonical_id != format!("{}/{}", m.base, m.quote) {
                return Err(ConfigError::BadMetadata(format!(
                    "canonical_id '{}' disagrees with base/quote {}/{}",
                    m.canonical_id, m.base, m.quote
                )));
            }
            if markets.insert(m.canonical_id.clone(), m).is_some() {
                return Err(ConfigError::BadMetadata(
                    "duplicate canonical_id in markets table".to_string(),
                ));
            }
        }

        let mut aliases: HashMap<(Exchange, String), String> = HashMap::new();
        let mut by_exchange: HashMap<Exchange, Vec<(String, String)>> = HashMap::new();

        for row in file.exchange_aliases {
            let exchange: Exchange = row.exchange.parse()?;

            let Some(market) = markets.get(&row.canonical_id) else {
                return Err(ConfigError::DanglingAlias {
                    exchange: row.exchange,
                    native: row.native_symbol,
                    canonical: row.canonical_id,
                });
            };

            // Disabled markets keep their alias rows in the database;
            // they simply never enter the live set.
            if !market.enabled {
                continue;
            }

            let key = (exchange, row.native_symbol.clone());
            if aliases.insert(key, row.canonical_id.clone()).is_some() {
                return Err(ConfigError::DuplicateAlias {
                    exchange: row.exchange,
                    native: row.native_symbol,
                });
            }

            by_exchange
                .entry(exchange)
                .or_default()
                .push((row.native_symbol, row.canonical_id));
        }

        Ok(Self {
            markets,
            aliases,
            by_exchange,
        })
    }

    /// Maps an exchange-native symbol to its canonical pair.
    ///
    /// `None` means UNKNOWN_SYMBOL: the caller drops the update and
    /// logs at DEBUG.
    pub fn canonicalize(&self, exchange: Exchange, native: &str) -> Option<&str> {
        self.aliases
            .get(&(exchange, native.to_string()))
            .map(String::as_str)
    }

    pub fn describe(&self, pair: &str) -> Option<&SymbolMetadata> {
        self.markets.get(pair)
    }

    /// `(native, canonical)` pairs a collector should subscribe to.
    pub fn for_exchange(&self, exchange: Exchange) -> &[(String, String)] {
        self.by_exchange
            .get(&exchange)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }
}
