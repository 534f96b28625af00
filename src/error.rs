use thiserror::Error;

/// Failures on the collector side of the pipeline.
///
/// POLICY:
/// - Transport and protocol errors cycle the connection (with backoff).
/// - Decode errors drop the offending frame only.
/// - Sequence gaps trigger a resubscribe for the affected book.
///
/// None of these cross a component boundary as a panic; every variant
/// ends up as a counter bump and a log line.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Socket drop, TLS failure, DNS failure.
    #[error("transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Malformed frame or a handshake the venue rejected.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Bad gzip or bad JSON inside an otherwise well-framed message.
    #[error("decode: {0}")]
    Decode(String),

    /// Orderbook diff continuity lost beyond what the gap buffer holds.
    #[error("sequence gap on {native}: expected {expected}, got {got}")]
    SequenceGap {
        native: String,
        expected: u64,
        got: u64,
    },

    /// The venue did not acknowledge our subscriptions in time.
    #[error("subscribe ack timed out after {0:?}")]
    SubscribeTimeout(std::time::Duration),

    /// No frame (data or heartbeat) within the idle deadline.
    #[error("heartbeat timed out after {0:?}")]
    HeartbeatTimeout(std::time::Duration),
}

/// Structural configuration failures.
///
/// These are fatal at startup, before any socket is opened. Nothing in
/// this enum is ever constructed after the process begins accepting
/// traffic.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {var}: {value}")]
    BadEnv { var: String, value: String },

    #[error("unknown exchange '{0}' in configuration")]
    UnknownExchange(String),

    /// Alias tables must be injective per exchange.
    #[error("duplicate alias {native} on {exchange}")]
    DuplicateAlias { exchange: String, native: String },

    #[error("alias {native} on {exchange} points at unknown market {canonical}")]
    DanglingAlias {
        exchange: String,
        native: String,
        canonical: String,
    },

    #[error("market metadata: {0}")]
    BadMetadata(String),
}
