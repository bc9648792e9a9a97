use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::RunError;

use super::registry::RunRegistry;

/// Periodically evicts finished runs (and their log files) once they are
/// older than `threshold`.
#[derive(Debug, Clone)]
pub struct CleanupSweeper {
    registry: RunRegistry,
    threshold: Duration,
    interval: Duration,
}

impl CleanupSweeper {
    pub fn new(registry: RunRegistry, threshold: Duration, interval: Duration) -> Self {
        Self {
            registry,
            threshold,
            interval,
        }
    }

    /// One sweep cycle. Returns the evicted run ids.
    ///
    /// Queued and running records are never candidates. A record with no
    /// timestamps at all is left alone.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<String>, RunError> {
        let expired: Vec<String> = self
            .registry
            .snapshot()?
            .into_iter()
            .filter(|record| record.status.is_terminal())
            .filter(|record| {
                record.last_activity().is_some_and(|at| {
                    now.signed_duration_since(at)
                        .to_std()
                        .is_ok_and(|age| age > self.threshold)
                })
            })
            .map(|record| record.run_id)
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for run_id in expired {
            let Some(record) = self.registry.evict(&run_id)? else {
                continue;
            };
            match tokio::fs::remove_file(&record.log_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(run_id = %run_id, path = %record.log_path.display(), error = %e, "Failed to delete run log");
                }
            }
            debug!(run_id = %run_id, "Evicted run");
            evicted.push(run_id);
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Cleaned up expired runs");
        }
        Ok(evicted)
    }

    /// Start the sweep loop on its own task. The first sweep happens after
    /// one full interval.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // interval() fires immediately; skip that tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once(Utc::now()).await {
                    warn!(error = %e, "Run cleanup failed");
                }
            }
        })
    }
}
