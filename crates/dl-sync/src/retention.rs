use std::time::Duration;

use tracing::{info, warn};

use crate::coordinator::SyncCoordinator;

/// Wait before retrying a failed prune or reclaim.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(300);

/// Delete archived queries older than `retention_days`, every `check_every`.
///
/// A failed prune, or a failed reclaim after it, is retried after
/// `RETRY_BACKOFF` instead of waiting for the next period. Observers are reset by the coordinator when rows go away.
pub async fn run_retention(coordinator: SyncCoordinator, retention_days: u32, check_every: Duration) {
    info!(
        "Retention task started (keeping {} days, checking every {:?})",
        retention_days, check_every
    );
    let keep = i64::from(retention_days) * 86_400;

    loop {
        tokio::time::sleep(check_every).await;
        loop {
            let cutoff = dl_common::now_ts() - keep;
            match coordinator.prune(cutoff).await {
                Ok(0) => break,
                Ok(n) => {
                    info!("Retention removed {} archived queries", n);
                    break;
                }
                Err(e) => {
                    warn!("Retention prune failed, retrying in {:?}: {:#}", RETRY_BACKOFF, e);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
}
