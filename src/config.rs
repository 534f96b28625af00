use std::env;
use std::fs;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::ConfigError;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from the JSON config file
// (`SPREADWATCH_CONFIG`, default `config.json`).
//
// It defines:
// - The markets metadata location
// - Dashboard server settings
// - Detector / cache tuning
// - Enabled venues
// - The optional redis mirror
//
// A handful of settings can be overridden from the environment; see
// `apply_env_overrides`. Anything structurally wrong here aborts the
// process before a single socket is opened.
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// JSON export of the `markets` + `exchange_aliases` tables.
    #[serde(default = "default_markets_file")]
    pub markets_file: String,

    #[serde(default)]
    pub dashboard: DashboardConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// List of venue configurations
    pub exchanges: Vec<VenueConfig>,

    /// Optional write-through mirror for the surrounding app's HTTP
    /// snapshot endpoints. Also enabled by `REDIS_HOST`.
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Demo mode: full pipeline, no mirror writes, extra logging.
    #[serde(default)]
    pub demo: bool,

    /// Upper bound on sockets across all venues.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_markets_file() -> String {
    "markets.json".to_string()
}

fn default_max_connections() -> usize {
    1000
}

// ------------------------------------------------------------
// Dashboard server configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    /// Listen address for dashboard WebSocket sessions.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Per-session bounded queue length. On overflow the oldest
    /// non-best event is dropped and the session is flagged stale.
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,

    /// Cadence of the aggregate stats event.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Opportunity batches flush on this timer...
    #[serde(default = "default_batch_flush_ms")]
    pub batch_flush_ms: u64,

    /// ...or as soon as this many accumulate.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
}

fn default_listen() -> String {
    "0.0.0.0:8765".to_string()
}

fn default_session_queue() -> usize {
    1024
}

fn default_stats_interval_secs() -> u64 {
    30
}

fn default_batch_flush_ms() -> u64 {
    100
}

fn default_batch_max() -> usize {
    64
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            session_queue: default_session_queue(),
            stats_interval_secs: default_stats_interval_secs(),
            batch_flush_ms: default_batch_flush_ms(),
            batch_max: default_batch_max(),
        }
    }
}

// ------------------------------------------------------------
// Detector configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    /// Worker parallelism. Work is sharded by pair, so per-pair
    /// ordering holds whatever this is set to.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Minimum profit percentage for an opportunity to surface.
    #[serde(default = "decimal_zero")]
    pub min_profit_pct: Decimal,

    /// Bound of the detector → cache channel.
    #[serde(default = "default_inbox")]
    pub inbox: usize,
}

fn default_workers() -> usize {
    8
}

fn decimal_zero() -> Decimal {
    Decimal::ZERO
}

fn default_inbox() -> usize {
    1024
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            min_profit_pct: Decimal::ZERO,
            inbox: default_inbox(),
        }
    }
}

// ------------------------------------------------------------
// Opportunity cache configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Opportunities not re-detected for this long are swept.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_sweep_secs() -> u64 {
    1
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

// ------------------------------------------------------------
// Venue configuration
// ------------------------------------------------------------
//
// Each venue runs independently. The subscription set itself comes
// from the symbol registry; this only carries operational knobs.
//
#[derive(Debug, Deserialize, Clone)]
pub struct VenueConfig {
    /// Venue identifier (e.g. "bingx", "wallex", "ramzinex").
    pub name: String,

    /// Enables or disables this venue at runtime.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Topics grouped onto one WebSocket connection. Clamped to the
    /// venue's own per-socket cap by the runner.
    #[serde(default = "default_topics_per_connection")]
    pub topics_per_connection: usize,

    /// Downtime after which the venue's quotes are marked stale and
    /// excluded from detection.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Optional credential; public market data needs none.
    /// Overridable via `<VENUE>_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_topics_per_connection() -> usize {
    50
}

fn default_grace_secs() -> u64 {
    30
}

#[cfg(test)]
impl VenueConfig {
    pub fn for_tests(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            topics_per_connection: default_topics_per_connection(),
            grace_secs: default_grace_secs(),
            api_key: None,
        }
    }
}

// ------------------------------------------------------------
// Redis mirror configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_redis_port() -> u16 {
    6379
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl Config {
    /// Reads and parses the JSON config file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut cfg: Config =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Recognized environment overrides:
    /// - `WORKER_COUNT`       detector parallelism
    /// - `MAX_CONNECTIONS`    global socket cap
    /// - `REDIS_HOST/PORT/DB/PASSWORD`  mirror location
    /// - `<VENUE>_API_KEY`    per-venue credential
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = read_env("WORKER_COUNT") {
            self.detector.workers = parse_env("WORKER_COUNT", &v)?;
        }
        if let Some(v) = read_env("MAX_CONNECTIONS") {
            self.max_connections = parse_env("MAX_CONNECTIONS", &v)?;
        }

        if let Some(host) = read_env("REDIS_HOST") {
            let mut redis = self.redis.clone().unwrap_or(RedisConfig {
                host: host.clone(),
                port: default_redis_port(),
                db: 0,
                password: None,
            });
            redis.host = host;
            if let Some(v) = read_env("REDIS_PORT") {
                redis.port = parse_env("REDIS_PORT", &v)?;
            }
            if let Some(v) = read_env("REDIS_DB") {
                redis.db = parse_env("REDIS_DB", &v)?;
            }
            if let Some(v) = read_env("REDIS_PASSWORD") {
                redis.password = Some(v);
            }
            self.redis = Some(redis);
        }

        for venue in &mut self.exchanges {
            let var = format!("{}_API_KEY", venue.name.to_uppercase());
            if let Some(key) = read_env(&var) {
                venue.api_key = Some(key);
            }
        }

        Ok(())
    }
}

fn read_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{ "exchanges": [ {"name": "bingx"}, {"name": "wallex", "enabled": false} ] }"#,
        )
        .unwrap();

        assert_eq!(cfg.markets_file, "markets.json");
        assert_eq!(cfg.dashboard.session_queue, 1024);
        assert_eq!(cfg.dashboard.batch_flush_ms, 100);
        assert_eq!(cfg.dashboard.batch_max, 64);
        assert_eq!(cfg.detector.workers, 8);
        assert_eq!(cfg.detector.min_profit_pct, Decimal::ZERO);
        assert_eq!(cfg.cache.ttl_secs, 60);
        assert_eq!(cfg.max_connections, 1000);
        assert!(cfg.exchanges[0].enabled);
        assert!(!cfg.exchanges[1].enabled);
        assert_eq!(cfg.exchanges[0].grace_secs, 30);
        assert!(cfg.redis.is_none());
        assert!(!cfg.demo);
    }

    #[test]
    fn redis_url_forms() {
        let plain = RedisConfig {
            host: "cache.internal".to_string(),
            port: 6379,
            db: 2,
            password: None,
        };
        assert_eq!(plain.url(), "redis://cache.internal:6379/2");

        let auth = RedisConfig {
            password: Some("hunter2".to_string()),
            ..plain
        };
        assert_eq!(auth.url(), "redis://:hunter2@cache.internal:6379/2");
    }
}
