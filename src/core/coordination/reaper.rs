use super::registry::{WorkerFilter, WorkerStatus};
use super::{Coordination, CoordinationError, CoordinationResult};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub interval: Duration,
    pub stale_after: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        ReaperSettings {
            interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub reaped: Vec<String>,
    pub released: Vec<String>,
}

/// Marks silent workers dead and returns their claims to the pool.
pub struct Reaper {
    coordination: Coordination,
    settings: ReaperSettings,
}

impl Reaper {
    pub fn new(coordination: Coordination, settings: ReaperSettings) -> Self {
        Reaper {
            coordination,
            settings,
        }
    }

    pub async fn reap_once(&self) -> CoordinationResult<ReapReport> {
        let filter = WorkerFilter {
            statuses: vec![WorkerStatus::Active, WorkerStatus::Draining],
            pool_id: Some(self.coordination.pool.pool_id().to_string()),
            stale_after: Some(self.settings.stale_after),
            ..Default::default()
        };
        let stale = self.coordination.registry.list(&filter).await?;

        let mut report = ReapReport::default();
        for worker in stale {
            match self
                .coordination
                .registry
                .update_status(&worker.worker_id, WorkerStatus::Dead)
                .await
            {
                Ok(()) | Err(CoordinationError::WorkerDead(_)) => {}
                Err(CoordinationError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
            // Release even if another reaper got there first; the update is idempotent.
            let released = self
                .coordination
                .pool
                .release_by_worker(&worker.worker_id)
                .await?;
            tracing::info!(
                worker_id = %worker.worker_id,
                last_heartbeat = %worker.last_heartbeat,
                released = released.len(),
                "reaped stale worker"
            );
            report.reaped.push(worker.worker_id);
            report.released.extend(released);
        }
        Ok(report)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        tracing::warn!(error = %e, "reaper pass failed");
                    }
                }
            }
        }
        tracing::info!("reaper stopped");
    }
}
