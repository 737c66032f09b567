use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};
use crate::observability;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once the log has taken `threshold` appends since the last
/// rewrite. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    info!("compacting WAL after {appends} appends");
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        match compact_if_due(&engine, threshold).await {
            Ok(true) => {
                metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            }
            Ok(false) => {}
            Err(e) => {
                metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
                warn!("WAL compaction failed: {e}");
            }
        }
    }
}
