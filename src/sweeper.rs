use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::engine::{Engine, Release};
use crate::limits::SWEEP_CONCURRENCY;
use crate::observability;

/// Background task that reports overdue claims and, if enabled, returns them.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, auto_release: bool) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine, auto_release).await;
    }
}

/// One sweep pass. Returns how many claims were released.
pub async fn sweep_once(engine: &Engine, auto_release: bool) -> usize {
    let now = chrono::Utc::now().timestamp_millis();
    let overdue = engine.collect_overdue_claims(now).await;
    metrics::gauge!(observability::OVERDUE_CLAIMS).set(overdue.len() as f64);
    if overdue.is_empty() || !auto_release {
        if !overdue.is_empty() {
            debug!("{} claims overdue", overdue.len());
        }
        return 0;
    }

    // Goes through release_unit like any other caller, so a claim returned
    // by its holder mid-sweep comes back as AlreadyReleased.
    futures::stream::iter(overdue)
        .map(|claim| async move {
            match engine.release_unit(claim.id).await {
                Ok(Release::Released(_)) => {
                    info!("released overdue claim {} held by {}", claim.id, claim.holder);
                    true
                }
                Ok(Release::AlreadyReleased(_)) => false,
                Err(e) => {
                    warn!("sweeper could not release {}: {e}", claim.id);
                    false
                }
            }
        })
        .buffer_unordered(SWEEP_CONCURRENCY)
        .filter(|released| futures::future::ready(*released))
        .count()
        .await
}

/// Background task that compacts the journal once enough records pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.journal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact().await {
            Ok(()) => debug!("compacted after {appends} appends"),
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
}
