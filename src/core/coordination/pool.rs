use super::{CoordinationError, CoordinationResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Claimed,
    Completed,
    /// Failed `max_retries` times; never reissued.
    Poisoned,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Claimed => "claimed",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Poisoned => "poisoned",
        }
    }

    pub fn parse(text: &str) -> CoordinationResult<Self> {
        match text {
            "pending" => Ok(WorkItemStatus::Pending),
            "claimed" => Ok(WorkItemStatus::Claimed),
            "completed" => Ok(WorkItemStatus::Completed),
            "poisoned" => Ok(WorkItemStatus::Poisoned),
            other => Err(CoordinationError::Serialization(format!(
                "unknown work item status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub pool_id: String,
    pub payload: Value,
    pub status: WorkItemStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_retries: u32,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(pool_id: &str, payload: Value, max_retries: u32) -> Self {
        let now = Utc::now();
        WorkItem {
            id: uuid::Uuid::new_v4().to_string(),
            pool_id: pool_id.to_string(),
            payload,
            status: WorkItemStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            attempts: 0,
            max_retries,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn owned_by(&self, worker_id: &str) -> bool {
        self.status == WorkItemStatus::Claimed && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// A named durable queue with atomic claim / complete / fail semantics.
#[async_trait]
pub trait WorkPool: Send + Sync {
    fn pool_id(&self) -> &str;

    async fn push(&self, payload: Value, max_retries: u32) -> CoordinationResult<String>;

    /// Atomically take the oldest pending item. `None` means the pool is drained.
    async fn claim(&self, worker_id: &str) -> CoordinationResult<Option<WorkItem>>;

    /// Rejected with `ClaimLost` when `worker_id` no longer owns the claim.
    async fn complete(&self, item_id: &str, worker_id: &str, result: Value)
        -> CoordinationResult<()>;

    /// Count one failed attempt. Returns the resulting status: `Pending` while
    /// attempts remain, `Poisoned` once `attempts >= max_retries`.
    async fn fail(
        &self,
        item_id: &str,
        worker_id: &str,
        error: &str,
    ) -> CoordinationResult<WorkItemStatus>;

    /// Pending depth.
    async fn size(&self) -> CoordinationResult<u64>;

    /// Return every item claimed by `worker_id` to pending. Returns their ids.
    async fn release_by_worker(&self, worker_id: &str) -> CoordinationResult<Vec<String>>;

    async fn get(&self, item_id: &str) -> CoordinationResult<Option<WorkItem>>;
}

/// In-process pool. A single mutex makes each operation atomic.
pub struct MemoryWorkPool {
    pool_id: String,
    items: Mutex<IndexMap<String, WorkItem>>,
}

impl MemoryWorkPool {
    pub fn new(pool_id: &str) -> Self {
        MemoryWorkPool {
            pool_id: pool_id.to_string(),
            items: Mutex::new(IndexMap::new()),
        }
    }
}

#[async_trait]
impl WorkPool for MemoryWorkPool {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    async fn push(&self, payload: Value, max_retries: u32) -> CoordinationResult<String> {
        let item = WorkItem::new(&self.pool_id, payload, max_retries);
        let id = item.id.clone();
        self.items.lock().await.insert(id.clone(), item);
        tracing::debug!(item_id = %id, pool_id = %self.pool_id, "pushed work item");
        Ok(id)
    }

    async fn claim(&self, worker_id: &str) -> CoordinationResult<Option<WorkItem>> {
        let mut items = self.items.lock().await;
        let Some(item) = items
            .values_mut()
            .find(|item| item.status == WorkItemStatus::Pending)
        else {
            return Ok(None);
        };
        let now = Utc::now();
        item.status = WorkItemStatus::Claimed;
        item.claimed_by = Some(worker_id.to_string());
        item.claimed_at = Some(now);
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn complete(
        &self,
        item_id: &str,
        worker_id: &str,
        result: Value,
    ) -> CoordinationResult<()> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(item_id)
            .ok_or_else(|| CoordinationError::NotFound(format!("work item {item_id}")))?;
        if !item.owned_by(worker_id) {
            return Err(CoordinationError::ClaimLost {
                item_id: item_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        item.status = WorkItemStatus::Completed;
        item.result = Some(result);
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(
        &self,
        item_id: &str,
        worker_id: &str,
        error: &str,
    ) -> CoordinationResult<WorkItemStatus> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(item_id)
            .ok_or_else(|| CoordinationError::NotFound(format!("work item {item_id}")))?;
        if !item.owned_by(worker_id) {
            return Err(CoordinationError::ClaimLost {
                item_id: item_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        item.attempts += 1;
        item.last_error = Some(error.to_string());
        item.updated_at = Utc::now();
        if item.attempts >= item.max_retries {
            item.status = WorkItemStatus::Poisoned;
        } else {
            item.status = WorkItemStatus::Pending;
            item.claimed_by = None;
            item.claimed_at = None;
        }
        Ok(item.status)
    }

    async fn size(&self) -> CoordinationResult<u64> {
        let items = self.items.lock().await;
        Ok(items
            .values()
            .filter(|item| item.status == WorkItemStatus::Pending)
            .count() as u64)
    }

    async fn release_by_worker(&self, worker_id: &str) -> CoordinationResult<Vec<String>> {
        let mut items = self.items.lock().await;
        let now = Utc::now();
        let mut released = Vec::new();
        for item in items.values_mut().filter(|item| item.owned_by(worker_id)) {
            item.status = WorkItemStatus::Pending;
            item.claimed_by = None;
            item.claimed_at = None;
            item.updated_at = now;
            released.push(item.id.clone());
        }
        Ok(released)
    }

    async fn get(&self, item_id: &str) -> CoordinationResult<Option<WorkItem>> {
        Ok(self.items.lock().await.get(item_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claims_in_push_order() {
        let pool = MemoryWorkPool::new("default");
        let first = pool.push(json!({"n": 1}), 3).await.unwrap();
        let second = pool.push(json!({"n": 2}), 3).await.unwrap();

        assert_eq!(pool.claim("w1").await.unwrap().unwrap().id, first);
        assert_eq!(pool.claim("w2").await.unwrap().unwrap().id, second);
        assert!(pool.claim("w3").await.unwrap().is_none());
        assert_eq!(pool.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn complete_by_non_owner_is_rejected() {
        let pool = MemoryWorkPool::new("default");
        let id = pool.push(json!({}), 1).await.unwrap();
        pool.claim("w1").await.unwrap();

        let err = pool.complete(&id, "w2", json!(null)).await.unwrap_err();
        assert!(matches!(err, CoordinationError::ClaimLost { .. }));
        let item = pool.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Claimed);

        pool.complete(&id, "w1", json!({"ok": true})).await.unwrap();
        let item = pool.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Completed);
        assert_eq!(item.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn fail_returns_to_pending_then_poisons() {
        let pool = MemoryWorkPool::new("default");
        let id = pool.push(json!({}), 2).await.unwrap();

        pool.claim("w1").await.unwrap();
        assert_eq!(
            pool.fail(&id, "w1", "boom").await.unwrap(),
            WorkItemStatus::Pending
        );
        let item = pool.get(&id).await.unwrap().unwrap();
        assert_eq!(item.claimed_by, None);
        assert_eq!(item.attempts, 1);

        pool.claim("w2").await.unwrap();
        assert_eq!(
            pool.fail(&id, "w2", "boom again").await.unwrap(),
            WorkItemStatus::Poisoned
        );
        assert!(pool.claim("w3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let pool = MemoryWorkPool::new("default");
        let err = pool.fail("missing", "w1", "x").await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound(_)));
    }
}
