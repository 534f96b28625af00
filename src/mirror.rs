use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use redis::AsyncCommands;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::RedisConfig;
use crate::hub::Hub;
use crate::metrics::METRICS;

/// Write-through mirror of the hot-path snapshots.
///
/// The surrounding application serves its HTTP snapshot endpoints
/// (`/api/prices/`, `/api/opportunities/`, `/api/stats/`) from these
/// keys. The mirror is strictly off the detection critical path:
/// writes happen on their own cadence from snapshots, and any redis
/// failure is counted, logged and retried without touching the
/// pipeline.
const WRITE_INTERVAL: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Keys expire a little past the write cadence so a dead mirror
/// leaves no permanently stale snapshots behind.
const KEY_TTL_SECS: u64 = 60;

const KEY_PRICES: &str = "spreadwatch:prices";
const KEY_OPPORTUNITIES: &str = "spreadwatch:opportunities";
const KEY_BEST: &str = "spreadwatch:best";
const KEY_STATS: &str = "spreadwatch:stats";

pub fn spawn(cfg: RedisConfig, hub: Arc<Hub>, shutdown: CancellationToken) {
    tokio::spawn(run(cfg, hub, shutdown));
}

async fn run(cfg: RedisConfig, hub: Arc<Hub>, shutdown: CancellationToken) {
    let client = match redis::Client::open(cfg.url()) {
        Ok(client) => client,
        Err(e) => {
            log::error!("mirror disabled, invalid redis target: {e}");
            return;
        }
    };
    log::info!("mirroring snapshots to redis at {}:{}", cfg.host, cfg.port);

    loop {
        let mut conn = tokio::select! {
            _ = shutdown.cancelled() => return,
            conn = client.get_multiplexed_async_connection() => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    METRICS.mirror_write_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("mirror connect failed: {e}");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(RECONNECT_DELAY) => continue,
                    }
                }
            },
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(WRITE_INTERVAL) => {}
            }

            if let Err(e) = write_snapshots(&mut conn, &hub).await {
                METRICS.mirror_write_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("mirror write failed: {e}");
                break;
            }
        }
    }
}

async fn write_snapshots(
    conn: &mut redis::aio::MultiplexedConnection,
    hub: &Hub,
) -> anyhow::Result<()> {
    let prices: Vec<_> = hub
        .store()
        .snapshot()
        .iter()
        .map(|q| hub.wire_quote(q))
        .collect();
    let opportunities = hub.cache().snapshot();
    let best = hub.cache().best();
    let stats = hub.stats();

    let _: () = conn
        .set_ex(KEY_PRICES, serde_json::to_string(&prices)?, KEY_TTL_SECS)
        .await?;
    let _: () = conn
        .set_ex(
            KEY_OPPORTUNITIES,
            serde_json::to_string(&opportunities)?,
            KEY_TTL_SECS,
        )
        .await?;
    let _: () = conn
        .set_ex(KEY_BEST, serde_json::to_string(&best)?, KEY_TTL_SECS)
        .await?;
    let _: () = conn
        .set_ex(KEY_STATS, serde_json::to_string(&stats)?, KEY_TTL_SECS)
        .await?;
    Ok(())
}
