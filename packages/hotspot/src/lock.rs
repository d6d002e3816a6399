//! Bounded acquisition of per-cluster update locks.
//!
//! Each attempt waits at most [`HotspotConfig::lock_wait`] for the lock.
//! Failed attempts are retried [`HotspotConfig::lock_retry_attempts`] times
//! with exponential backoff (10ms, 20ms, 40ms with the defaults) before
//! giving up with [`ClusterError::LockTimeout`]. Abandoning a wait never
//! affects the cluster: only the holder of the guard mutates it.
//!
//! Guards are owned so that a caller can keep a cluster locked while it
//! persists and publishes the cluster's new state.

use std::sync::Arc;

use crime_watch_hotspot_models::{ClusterId, HotspotConfig};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::ClusterError;

/// Acquires `mutex`, retrying with backoff.
///
/// # Errors
///
/// Returns [`ClusterError::LockTimeout`] if every attempt times out.
pub async fn lock_with_backoff<T>(
    mutex: &Arc<Mutex<T>>,
    cluster_id: ClusterId,
    config: &HotspotConfig,
) -> Result<OwnedMutexGuard<T>, ClusterError> {
    let attempts = config.lock_retry_attempts.saturating_add(1);

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = config.lock_backoff(attempt);
            log::debug!(
                "Cluster {cluster_id} busy, retry {attempt}/{} in {delay:?}",
                config.lock_retry_attempts
            );
            tokio::time::sleep(delay).await;
        }

        if let Ok(guard) = tokio::time::timeout(config.lock_wait(), Arc::clone(mutex).lock_owned()).await {
            return Ok(guard);
        }
    }

    log::warn!("Gave up waiting for cluster {cluster_id} lock after {attempts} attempts");
    Err(ClusterError::LockTimeout {
        cluster_id,
        attempts,
    })
}
