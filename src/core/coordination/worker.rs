use super::pool::{WorkItem, WorkPool};
use super::registry::{HeartbeatUpdate, WorkerInfo, WorkerRegistry, WorkerStatus};
use super::{Coordination, CoordinationError, CoordinationResult};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::{Interpreter, ResumeOptions, RunOptions};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What a worker does with a claimed item.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, item: &WorkItem) -> Result<Value, AppError>;
}

#[derive(Debug, Deserialize)]
struct WorkflowJob {
    workflow: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    execution_id: Option<String>,
}

/// Runs `{workflow, input}` payloads through the interpreter.
///
/// The execution id defaults to the work item id, so an item re-claimed after its
/// first worker died resumes from that worker's last checkpoint instead of starting over.
/// Retries after a recorded failure run under [`attempt_execution_id`].
pub struct WorkflowJobProcessor {
    interpreter: Interpreter,
}

impl WorkflowJobProcessor {
    pub fn new(interpreter: Interpreter) -> Self {
        WorkflowJobProcessor { interpreter }
    }
}

#[async_trait]
impl JobProcessor for WorkflowJobProcessor {
    async fn process(&self, item: &WorkItem) -> Result<Value, AppError> {
        let job: WorkflowJob = serde_json::from_value(item.payload.clone()).map_err(|e| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("work item {} is not a workflow job: {}", item.id, e),
            )
            .with_code("CRD-006")
        })?;
        let execution_id = attempt_execution_id(
            job.execution_id.as_deref().unwrap_or(&item.id),
            item.attempts,
        );

        let existing = self.interpreter.snapshot(&execution_id).await?;
        let outcome = if existing.is_some() {
            // Non-terminal: continue a crashed worker's run. Terminal: replay its outcome.
            tracing::info!(item_id = %item.id, execution_id = %execution_id, "resuming workflow job");
            self.interpreter
                .resume(&execution_id, ResumeOptions::default())
                .await?
        } else {
            let options = RunOptions {
                execution_id: Some(execution_id.clone()),
                ..RunOptions::default()
            };
            self.interpreter
                .start(&job.workflow, job.input, options)
                .await?
        };

        Ok(json!({
            "execution_id": outcome.execution_id,
            "output": outcome.output,
            "steps": outcome.steps,
        }))
    }
}

/// Execution id for one attempt at a work item.
///
/// The first attempt uses the base id. Each failed attempt recorded by the pool
/// moves later attempts to a fresh id, so a retry runs the workflow again instead
/// of replaying the failed snapshot. A claim released by the reaper keeps its
/// attempt count and therefore resumes the interrupted run.
pub fn attempt_execution_id(base: &str, attempts: u32) -> String {
    if attempts == 0 {
        base.to_string()
    } else {
        format!("{base}-attempt{attempts}")
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub capabilities: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped by its cancellation token and deregistered cleanly.
    Cancelled,
    /// Found itself marked dead by the reaper.
    Reaped,
}

/// Registers once, then loops claim, process, complete-or-fail.
pub struct Worker {
    info: WorkerInfo,
    pool: Arc<dyn WorkPool>,
    registry: Arc<dyn WorkerRegistry>,
    processor: Arc<dyn JobProcessor>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        coordination: &Coordination,
        processor: Arc<dyn JobProcessor>,
        settings: WorkerSettings,
    ) -> Self {
        let info = WorkerInfo::local(coordination.pool.pool_id(), settings.capabilities.clone());
        Worker {
            info,
            pool: coordination.pool.clone(),
            registry: coordination.registry.clone(),
            processor,
            settings,
        }
    }

    pub fn with_info(mut self, info: WorkerInfo) -> Self {
        self.info = info;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.info.worker_id
    }

    pub async fn run(&self, cancel: CancellationToken) -> CoordinationResult<WorkerExit> {
        let worker_id = self.worker_id().to_string();
        self.registry.register(self.info.clone()).await?;
        tracing::info!(worker_id = %worker_id, pool_id = %self.info.pool_id, "worker registered");

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        heartbeat.tick().await;

        let mut draining = false;
        while !cancel.is_cancelled() {
            let item = match self.pool.claim(&worker_id).await {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "claim failed");
                    None
                }
            };

            let Some(item) = item else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    _ = heartbeat.tick() => {
                        if let Some(exit) = self.beat(None).await {
                            return Ok(exit);
                        }
                    }
                }
                continue;
            };

            tracing::info!(worker_id = %worker_id, item_id = %item.id, attempt = item.attempts + 1, "claimed work item");
            if let Some(exit) = self.beat(Some(&item.id)).await {
                return Ok(exit);
            }

            let processing = self.processor.process(&item);
            tokio::pin!(processing);
            let result = loop {
                tokio::select! {
                    result = &mut processing => break result,
                    _ = heartbeat.tick() => {
                        if let Some(exit) = self.beat(Some(&item.id)).await {
                            return Ok(exit);
                        }
                    }
                    _ = cancel.cancelled(), if !draining => {
                        draining = true;
                        self.set_status(WorkerStatus::Draining).await;
                    }
                }
            };

            self.settle(&item, result).await?;
            if let Some(exit) = self.beat(None).await {
                return Ok(exit);
            }
        }

        if !draining {
            self.set_status(WorkerStatus::Draining).await;
        }
        self.set_status(WorkerStatus::Dead).await;
        tracing::info!(worker_id = %worker_id, "worker stopped");
        Ok(WorkerExit::Cancelled)
    }

    async fn settle(&self, item: &WorkItem, result: Result<Value, AppError>) -> CoordinationResult<()> {
        let worker_id = self.worker_id();
        let settled = match result {
            Ok(output) => self
                .pool
                .complete(&item.id, worker_id, output)
                .await
                .map(|_| tracing::info!(worker_id = %worker_id, item_id = %item.id, "work item completed")),
            Err(err) => {
                tracing::warn!(worker_id = %worker_id, item_id = %item.id, code = %err.code, error = %err.message, "work item failed");
                self.pool
                    .fail(&item.id, worker_id, &err.to_string())
                    .await
                    .map(|status| tracing::info!(worker_id = %worker_id, item_id = %item.id, status = status.as_str(), "recorded failed attempt"))
            }
        };
        match settled {
            Err(CoordinationError::ClaimLost { .. }) => {
                // The reaper released this claim while we were busy; another worker owns it now.
                tracing::warn!(worker_id = %worker_id, item_id = %item.id, "claim lost before settle; result discarded");
                Ok(())
            }
            other => other,
        }
    }

    /// Refresh liveness. Returns an exit reason once the worker has been reaped.
    async fn beat(&self, current_item: Option<&str>) -> Option<WorkerExit> {
        let update = HeartbeatUpdate {
            current_item: current_item.map(str::to_string),
            metadata: None,
        };
        match self.registry.heartbeat(self.worker_id(), update).await {
            Ok(_) => None,
            Err(CoordinationError::WorkerDead(_)) => {
                tracing::warn!(worker_id = %self.worker_id(), "worker was marked dead; stopping");
                Some(WorkerExit::Reaped)
            }
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id(), error = %e, "heartbeat failed");
                None
            }
        }
    }

    async fn set_status(&self, status: WorkerStatus) {
        if let Err(e) = self.registry.update_status(self.worker_id(), status).await {
            tracing::warn!(worker_id = %self.worker_id(), status = status.as_str(), error = %e, "status update failed");
        }
    }
}
