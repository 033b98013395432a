use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that rewrites the booking log once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await {
            info!("booking log compacted");
        }
    }
}

/// Compact when at least `threshold` events were appended since the last
/// compaction. Returns whether it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(kept) => {
            tracing::debug!("compaction folded {appends} appends into {kept} bookings");
            true
        }
        Err(e) => {
            tracing::error!("booking log compaction failed: {e}");
            false
        }
    }
}
