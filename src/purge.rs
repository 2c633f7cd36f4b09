//! Periodic reconciliation of expired and idle cache entries.

use crate::cache::MetadataIndex;
use crate::config::{IDLE_EVICTION_AGE, PURGE_INTERVAL};
use crate::storage::ObjectStore;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::watch;

#[derive(Debug, Default, Clone, Copy)]
pub struct PurgeSummary {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub struct Purger {
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn MetadataIndex>,
}

impl Purger {
    pub fn new(store: Arc<dyn ObjectStore>, index: Arc<dyn MetadataIndex>) -> Self {
        Self { store, index }
    }

    /// Run cycles on a fixed interval until the shutdown signal flips.
    /// An in-flight cycle is finished before exiting.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Starting cache purger");
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the first cycle should not
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Stopping cache purger");
                        return;
                    }
                }
            }
        })
    }

    /// One reconciliation pass. Per-entry failures never abort the cycle.
    pub async fn run_cycle(&self) -> PurgeSummary {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();
        let idle_cutoff = now - IDLE_EVICTION_AGE;
        let mut summary = PurgeSummary::default();

        match self.index.expired_cache_entries(now, idle_cutoff).await {
            Ok(entries) => {
                for entry in entries {
                    summary.scanned += 1;
                    if let Err(e) = self.store.delete(&entry.key).await {
                        tracing::error!(key = %entry.key, error = %e, "Failed to delete cached object");
                        summary.failed += 1;
                        continue;
                    }
                    match self.index.delete_cache_entry(&entry.key).await {
                        Ok(()) => summary.deleted += 1,
                        Err(e) => {
                            tracing::error!(key = %entry.key, error = %e, "Failed to delete cache entry");
                            summary.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Registry cache purge query failed");
            }
        }

        match self.index.expired_tag_entries(now).await {
            Ok(entries) => {
                for entry in entries {
                    summary.scanned += 1;
                    match self.index.delete_tag_entry(&entry.repository).await {
                        Ok(_) => summary.deleted += 1,
                        Err(e) => {
                            tracing::error!(
                                repository = %entry.repository,
                                error = %e,
                                "Failed to delete tag cache entry"
                            );
                            summary.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Tag cache purge query failed");
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            deleted = summary.deleted,
            failed = summary.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Cache purge cycle complete"
        );

        summary
    }
}
