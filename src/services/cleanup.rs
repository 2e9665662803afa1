//! Cleanup service for expired upload progress records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use crate::error::AppResult;
use crate::services::progress_store::ProgressStore;

/// Configuration for the cleanup service.
#[derive(Clone)]
pub struct CleanupConfig {
    /// How often to run cleanup (in seconds)
    pub interval_secs: u64,
}

/// Start the cleanup background task.
///
/// This spawns a tokio task that periodically purges progress records past
/// their expiry. The task stops when `shutdown` flips to `true` or its sender
/// is dropped.
pub fn start_cleanup_task(
    store: Arc<dyn ProgressStore>,
    config: CleanupConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting progress cleanup service (interval: {} seconds)",
            config.interval_secs
        );

        let mut ticker = interval(Duration::from_secs(config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = run_cleanup(store.as_ref()).await {
                error!("Cleanup task error: {}", e);
            }
        }

        info!("Progress cleanup service stopped");
    })
}

/// Run a single cleanup cycle. Returns the number of purged records.
pub async fn run_cleanup(store: &dyn ProgressStore) -> AppResult<u64> {
    let purged = store.purge_expired().await?;

    if purged > 0 {
        info!("Purged {} expired upload progress records", purged);
    } else {
        debug!("No expired upload progress records");
    }

    Ok(purged)
}
