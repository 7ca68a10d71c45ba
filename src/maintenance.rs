//! Background housekeeping for the session store and the in-process cache

use crate::auth::TokenRotationEngine;
use crate::cache::MemoryCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// One sweep: stale refresh tokens, then expired cache entries.
pub async fn run_once(tokens: &TokenRotationEngine, cache: &MemoryCache) -> usize {
    let removed_tokens = match tokens.cleanup().await {
        Ok(n) => n,
        Err(e) => {
            warn!("⚠️  Session cleanup failed (non-critical): {}", e);
            0
        }
    };
    let purged = cache.purge_expired();

    if removed_tokens > 0 || purged > 0 {
        info!(removed_tokens, purged, "🧹 Maintenance sweep");
    } else {
        debug!("Maintenance sweep: nothing to do");
    }
    removed_tokens + purged
}

pub fn spawn_maintenance(
    tokens: Arc<TokenRotationEngine>,
    cache: Arc<MemoryCache>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("🧹 Maintenance task started (every {}s)", every.as_secs());
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_once(&tokens, &cache).await;
        }
    })
}
