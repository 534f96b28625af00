// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::env;
use std::str::FromStr;
use std::sync::Arc;

use rustls::crypto::{CryptoProvider, ring};
use tokio_util::sync::CancellationToken;

use spreadwatch::cache::{self, OpportunityCache};
use spreadwatch::config::Config;
use spreadwatch::exchanges::get_adapter;
use spreadwatch::hub::{self, Hub};
use spreadwatch::schema::Exchange;
use spreadwatch::store::TopOfBookStore;
use spreadwatch::symbols::SymbolRegistry;
use spreadwatch::{collector, detector, mirror};

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// This is the main runtime for the arbitrage monitoring backend.
//
// Responsibilities:
// - Initialize cryptography backend (rustls) and logging
// - Load configuration and the symbol registry (fatal on error,
//   before any socket is opened)
// - Wire the pipeline: collectors → store → detector → cache → hub
// - Start enabled venue collectors
// - Propagate shutdown on ctrl-c
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation, exactly once and as early as possible in the
    // process lifecycle.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    env_logger::Builder::from_env(env_logger::Env::default().filter_or("LOG_LEVEL", "info"))
        .init();

    // --------------------------------------------------------
    // Configuration and metadata. Any structural problem here
    // aborts the process before it accepts traffic.
    // --------------------------------------------------------
    let config_path =
        env::var("SPREADWATCH_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = Config::load(&config_path)?;

    let registry = Arc::new(SymbolRegistry::load(&config.markets_file)?);
    log::info!(
        "loaded {} markets from {}",
        registry.market_count(),
        config.markets_file
    );

    let shutdown = CancellationToken::new();

    // --------------------------------------------------------
    // Pipeline wiring:
    //
    //   collectors → store → detector → cache → hub → dashboards
    //
    // The store and cache also feed the hub directly for the
    // per-session open snapshots.
    // --------------------------------------------------------
    let store = Arc::new(TopOfBookStore::new(4096));
    let cache = Arc::new(OpportunityCache::new());

    let detections = detector::spawn(store.clone(), &config.detector, shutdown.clone());
    let cache_events = cache::spawn(cache.clone(), &config.cache, detections, shutdown.clone());

    let hub = Hub::new(
        registry.clone(),
        store.clone(),
        cache.clone(),
        config.dashboard.clone(),
    );
    hub::spawn(hub.clone(), cache_events, shutdown.clone()).await?;

    // --------------------------------------------------------
    // Optional redis mirror for the surrounding application's
    // HTTP snapshot endpoints. Demo mode keeps everything
    // in-process and logs accepted quotes instead.
    // --------------------------------------------------------
    if config.demo {
        log::info!("demo mode: redis mirror disabled");
        let mut quotes = store.subscribe();
        tokio::spawn(async move {
            loop {
                match quotes.recv().await {
                    Ok(changed) => {
                        let q = changed.quote;
                        log::info!(
                            "DEMO {} {} bid {} x {} / ask {} x {}",
                            q.exchange,
                            q.pair,
                            q.bid_price,
                            q.bid_volume,
                            q.ask_price,
                            q.ask_volume
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    } else if let Some(redis_cfg) = config.redis.clone() {
        mirror::spawn(redis_cfg, hub.clone(), shutdown.clone());
    }

    // --------------------------------------------------------
    // Start all enabled venue collectors. Each venue spawns its
    // own set of independent socket tasks.
    // --------------------------------------------------------
    for venue in &config.exchanges {
        if !venue.enabled {
            log::info!("{}: disabled in configuration, skipping", venue.name);
            continue;
        }
        let exchange = Exchange::from_str(&venue.name)?;
        let adapter = get_adapter(exchange);
        collector::run_exchange(
            adapter,
            venue.clone(),
            config.max_connections,
            registry.clone(),
            store.clone(),
            shutdown.clone(),
        )
        .await?;
    }

    // --------------------------------------------------------
    // Run until the operator stops us; then cancel everything and
    // give tasks a moment to close their sockets gracefully.
    // --------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");
    shutdown.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    Ok(())
}
