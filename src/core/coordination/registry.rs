use super::{CoordinationError, CoordinationResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Draining,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Dead => "dead",
        }
    }

    pub fn parse(text: &str) -> CoordinationResult<Self> {
        match text {
            "active" => Ok(WorkerStatus::Active),
            "draining" => Ok(WorkerStatus::Draining),
            "dead" => Ok(WorkerStatus::Dead),
            other => Err(CoordinationError::Serialization(format!(
                "unknown worker status '{other}'"
            ))),
        }
    }
}

/// Identity a worker declares when registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub host: String,
    pub pid: u32,
    pub capabilities: Vec<String>,
    pub pool_id: String,
}

impl WorkerInfo {
    /// Identity for a worker running in the current process.
    pub fn local(pool_id: &str, capabilities: Vec<String>) -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        WorkerInfo {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            host,
            pid: std::process::id(),
            capabilities,
            pool_id: pool_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub host: String,
    pub pid: u32,
    pub capabilities: Vec<String>,
    pub pool_id: String,
    pub started_at: DateTime<Utc>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub current_item: Option<String>,
    pub metadata: Value,
}

impl WorkerRecord {
    pub fn from_info(info: WorkerInfo, now: DateTime<Utc>) -> Self {
        WorkerRecord {
            worker_id: info.worker_id,
            host: info.host,
            pid: info.pid,
            capabilities: info.capabilities,
            pool_id: info.pool_id,
            started_at: now,
            status: WorkerStatus::Active,
            last_heartbeat: now,
            current_item: None,
            metadata: Value::Object(Default::default()),
        }
    }
}

/// Liveness refresh. `current_item` is always written; `metadata` only when set.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub current_item: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    /// Any of these statuses; empty matches all.
    pub statuses: Vec<WorkerStatus>,
    pub capability: Option<String>,
    pub pool_id: Option<String>,
    /// Only workers whose last heartbeat is older than this.
    pub stale_after: Option<Duration>,
}

impl WorkerFilter {
    pub fn with_statuses(statuses: &[WorkerStatus]) -> Self {
        WorkerFilter {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn stale_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.stale_after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now - d)
    }

    pub fn matches(&self, record: &WorkerRecord, now: DateTime<Utc>) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(capability) = &self.capability {
            if !record.capabilities.iter().any(|c| c == capability) {
                return false;
            }
        }
        if let Some(pool_id) = &self.pool_id {
            if &record.pool_id != pool_id {
                return false;
            }
        }
        if let Some(cutoff) = self.stale_cutoff(now) {
            if record.last_heartbeat >= cutoff {
                return false;
            }
        }
        true
    }
}

/// Worker liveness bookkeeping shared by every coordination role.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Insert (or refresh) a record with status active and heartbeat now.
    /// A worker already marked dead is refused.
    async fn register(&self, info: WorkerInfo) -> CoordinationResult<WorkerRecord>;

    /// Fails with `WorkerDead` once the reaper has marked the worker dead.
    async fn heartbeat(
        &self,
        worker_id: &str,
        update: HeartbeatUpdate,
    ) -> CoordinationResult<WorkerRecord>;

    /// Dead is terminal; moving a dead worker to any other status fails with `WorkerDead`.
    async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> CoordinationResult<()>;

    async fn list(&self, filter: &WorkerFilter) -> CoordinationResult<Vec<WorkerRecord>>;

    async fn get(&self, worker_id: &str) -> CoordinationResult<Option<WorkerRecord>>;
}

#[derive(Default)]
pub struct MemoryWorkerRegistry {
    workers: Mutex<IndexMap<String, WorkerRecord>>,
}

impl MemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn register(&self, info: WorkerInfo) -> CoordinationResult<WorkerRecord> {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(&info.worker_id) {
            if existing.status == WorkerStatus::Dead {
                return Err(CoordinationError::WorkerDead(info.worker_id));
            }
        }
        let record = WorkerRecord::from_info(info, Utc::now());
        workers.insert(record.worker_id.clone(), record.clone());
        Ok(record)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        update: HeartbeatUpdate,
    ) -> CoordinationResult<WorkerRecord> {
        let mut workers = self.workers.lock().await;
        let record = workers
            .get_mut(worker_id)
            .ok_or_else(|| CoordinationError::NotFound(format!("worker {worker_id}")))?;
        if record.status == WorkerStatus::Dead {
            return Err(CoordinationError::WorkerDead(worker_id.to_string()));
        }
        record.last_heartbeat = Utc::now();
        record.current_item = update.current_item;
        if let Some(metadata) = update.metadata {
            record.metadata = metadata;
        }
        Ok(record.clone())
    }

    async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> CoordinationResult<()> {
        let mut workers = self.workers.lock().await;
        let record = workers
            .get_mut(worker_id)
            .ok_or_else(|| CoordinationError::NotFound(format!("worker {worker_id}")))?;
        if record.status == WorkerStatus::Dead && status != WorkerStatus::Dead {
            return Err(CoordinationError::WorkerDead(worker_id.to_string()));
        }
        record.status = status;
        Ok(())
    }

    async fn list(&self, filter: &WorkerFilter) -> CoordinationResult<Vec<WorkerRecord>> {
        let now = Utc::now();
        let workers = self.workers.lock().await;
        Ok(workers
            .values()
            .filter(|record| filter.matches(record, now))
            .cloned()
            .collect())
    }

    async fn get(&self, worker_id: &str) -> CoordinationResult<Option<WorkerRecord>> {
        Ok(self.workers.lock().await.get(worker_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, capabilities: &[&str]) -> WorkerInfo {
        WorkerInfo {
            worker_id: id.to_string(),
            host: "test-host".to_string(),
            pid: 1,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            pool_id: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn dead_workers_cannot_heartbeat_or_revive() {
        let registry = MemoryWorkerRegistry::new();
        registry.register(info("w1", &[])).await.unwrap();
        registry
            .update_status("w1", WorkerStatus::Dead)
            .await
            .unwrap();

        let err = registry
            .heartbeat("w1", HeartbeatUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::WorkerDead(_)));
        assert!(registry
            .update_status("w1", WorkerStatus::Active)
            .await
            .is_err());
        assert!(registry.register(info("w1", &[])).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_capability() {
        let registry = MemoryWorkerRegistry::new();
        registry.register(info("gpu", &["gpu"])).await.unwrap();
        registry.register(info("cpu", &["cpu"])).await.unwrap();
        registry
            .update_status("cpu", WorkerStatus::Draining)
            .await
            .unwrap();

        let filter = WorkerFilter {
            capability: Some("gpu".to_string()),
            ..Default::default()
        };
        let gpu = registry.list(&filter).await.unwrap();
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].worker_id, "gpu");

        let draining = registry
            .list(&WorkerFilter::with_statuses(&[WorkerStatus::Draining]))
            .await
            .unwrap();
        assert_eq!(draining.len(), 1);
        assert_eq!(draining[0].worker_id, "cpu");
    }

    #[tokio::test]
    async fn stale_filter_uses_last_heartbeat() {
        let registry = MemoryWorkerRegistry::new();
        registry.register(info("w1", &[])).await.unwrap();
        let filter = WorkerFilter {
            stale_after: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        assert!(registry.list(&filter).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.list(&filter).await.unwrap().len(), 1);

        registry
            .heartbeat("w1", HeartbeatUpdate::default())
            .await
            .unwrap();
        assert!(registry.list(&filter).await.unwrap().is_empty());
    }
}
