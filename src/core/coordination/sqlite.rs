//! SQLite backends for the work pool and worker registry.
//!
//! Both share one [`DatabasePool`]: a single-connection writer that serializes
//! every mutation and a multi-connection read-only pool for queries. `claim` is one
//! conditional `UPDATE ... RETURNING`, so concurrent workers in separate
//! processes can never both win the same row.

use super::pool::{WorkItem, WorkItemStatus, WorkPool};
use super::registry::{
    HeartbeatUpdate, WorkerFilter, WorkerInfo, WorkerRecord, WorkerRegistry, WorkerStatus,
};
use super::{parse_timestamp, timestamp, CoordinationError, CoordinationResult};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Split read/write pool in WAL mode.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools and run migrations on the writer before the reader connects.
    pub async fn new(database_url: &str) -> CoordinationResult<Self> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts)
            .await?;

        sqlx::migrate!("./migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        Ok(Self { reader, writer })
    }
}

// ---------------------------------------------------------------------------
// Work pool
// ---------------------------------------------------------------------------

pub struct SqliteWorkPool {
    db: DatabasePool,
    pool_id: String,
}

impl SqliteWorkPool {
    pub fn new(db: DatabasePool, pool_id: &str) -> Self {
        SqliteWorkPool {
            db,
            pool_id: pool_id.to_string(),
        }
    }

    /// Explain a zero-row conditional update: either the item is gone or the claim moved.
    async fn rejection(&self, item_id: &str, worker_id: &str) -> CoordinationError {
        match self.get(item_id).await {
            Ok(Some(_)) => CoordinationError::ClaimLost {
                item_id: item_id.to_string(),
                worker_id: worker_id.to_string(),
            },
            Ok(None) => CoordinationError::NotFound(format!("work item {item_id}")),
            Err(e) => e,
        }
    }
}

fn work_item_from_row(row: &SqliteRow) -> CoordinationResult<WorkItem> {
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let claimed_at: Option<String> = row.try_get("claimed_at")?;
    let result: Option<String> = row.try_get("result")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_retries: i64 = row.try_get("max_retries")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(WorkItem {
        id: row.try_get("id")?,
        pool_id: row.try_get("pool_id")?,
        payload: serde_json::from_str(&payload)?,
        status: WorkItemStatus::parse(&status)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: claimed_at.as_deref().map(parse_timestamp).transpose()?,
        attempts: attempts as u32,
        max_retries: max_retries as u32,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        last_error: row.try_get("last_error")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl WorkPool for SqliteWorkPool {
    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    async fn push(&self, payload: Value, max_retries: u32) -> CoordinationResult<String> {
        let item = WorkItem::new(&self.pool_id, payload, max_retries);
        let now = timestamp(item.created_at);
        sqlx::query(
            "INSERT INTO work_items (id, pool_id, payload, status, attempts, max_retries, created_at, updated_at)
             VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&self.pool_id)
        .bind(serde_json::to_string(&item.payload)?)
        .bind(max_retries as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.db.writer)
        .await?;

        tracing::debug!(item_id = %item.id, pool_id = %self.pool_id, "pushed work item");
        Ok(item.id)
    }

    async fn claim(&self, worker_id: &str) -> CoordinationResult<Option<WorkItem>> {
        let now = timestamp(Utc::now());
        let row = sqlx::query(
            "UPDATE work_items
             SET status = 'claimed', claimed_by = ?, claimed_at = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM work_items
                 WHERE pool_id = ? AND status = 'pending'
                 ORDER BY rowid
                 LIMIT 1
             )
             AND status = 'pending'
             RETURNING *",
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&now)
        .bind(&self.pool_id)
        .fetch_optional(&self.db.writer)
        .await?;

        row.as_ref().map(work_item_from_row).transpose()
    }

    async fn complete(
        &self,
        item_id: &str,
        worker_id: &str,
        result: Value,
    ) -> CoordinationResult<()> {
        let outcome = sqlx::query(
            "UPDATE work_items
             SET status = 'completed', result = ?, updated_at = ?
             WHERE id = ? AND status = 'claimed' AND claimed_by = ?",
        )
        .bind(serde_json::to_string(&result)?)
        .bind(timestamp(Utc::now()))
        .bind(item_id)
        .bind(worker_id)
        .execute(&self.db.writer)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(self.rejection(item_id, worker_id).await);
        }
        Ok(())
    }

    async fn fail(
        &self,
        item_id: &str,
        worker_id: &str,
        error: &str,
    ) -> CoordinationResult<WorkItemStatus> {
        // SET expressions all read the pre-update row, so `attempts + 1` is the new count everywhere.
        let row = sqlx::query(
            "UPDATE work_items
             SET attempts = attempts + 1,
                 last_error = ?,
                 updated_at = ?,
                 status = CASE WHEN attempts + 1 >= max_retries THEN 'poisoned' ELSE 'pending' END,
                 claimed_by = CASE WHEN attempts + 1 >= max_retries THEN claimed_by ELSE NULL END,
                 claimed_at = CASE WHEN attempts + 1 >= max_retries THEN claimed_at ELSE NULL END
             WHERE id = ? AND status = 'claimed' AND claimed_by = ?
             RETURNING status",
        )
        .bind(error)
        .bind(timestamp(Utc::now()))
        .bind(item_id)
        .bind(worker_id)
        .fetch_optional(&self.db.writer)
        .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                WorkItemStatus::parse(&status)
            }
            None => Err(self.rejection(item_id, worker_id).await),
        }
    }

    async fn size(&self) -> CoordinationResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM work_items WHERE pool_id = ? AND status = 'pending'",
        )
        .bind(&self.pool_id)
        .fetch_one(&self.db.reader)
        .await?;
        Ok(count as u64)
    }

    async fn release_by_worker(&self, worker_id: &str) -> CoordinationResult<Vec<String>> {
        let rows = sqlx::query(
            "UPDATE work_items
             SET status = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = ?
             WHERE pool_id = ? AND status = 'claimed' AND claimed_by = ?
             RETURNING id",
        )
        .bind(timestamp(Utc::now()))
        .bind(&self.pool_id)
        .bind(worker_id)
        .fetch_all(&self.db.writer)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(Into::into))
            .collect()
    }

    async fn get(&self, item_id: &str) -> CoordinationResult<Option<WorkItem>> {
        let row = sqlx::query("SELECT * FROM work_items WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&self.db.reader)
            .await?;
        row.as_ref().map(work_item_from_row).transpose()
    }
}

// ---------------------------------------------------------------------------
// Worker registry
// ---------------------------------------------------------------------------

pub struct SqliteWorkerRegistry {
    db: DatabasePool,
}

impl SqliteWorkerRegistry {
    pub fn new(db: DatabasePool) -> Self {
        SqliteWorkerRegistry { db }
    }

    async fn rejection(&self, worker_id: &str) -> CoordinationError {
        match self.get(worker_id).await {
            Ok(Some(record)) if record.status == WorkerStatus::Dead => {
                CoordinationError::WorkerDead(worker_id.to_string())
            }
            Ok(_) => CoordinationError::NotFound(format!("worker {worker_id}")),
            Err(e) => e,
        }
    }
}

fn worker_from_row(row: &SqliteRow) -> CoordinationResult<WorkerRecord> {
    let capabilities: String = row.try_get("capabilities")?;
    let metadata: String = row.try_get("metadata")?;
    let status: String = row.try_get("status")?;
    let pid: i64 = row.try_get("pid")?;
    let started_at: String = row.try_get("started_at")?;
    let last_heartbeat: String = row.try_get("last_heartbeat")?;

    Ok(WorkerRecord {
        worker_id: row.try_get("worker_id")?,
        host: row.try_get("host")?,
        pid: pid as u32,
        capabilities: serde_json::from_str(&capabilities)?,
        pool_id: row.try_get("pool_id")?,
        started_at: parse_timestamp(&started_at)?,
        status: WorkerStatus::parse(&status)?,
        last_heartbeat: parse_timestamp(&last_heartbeat)?,
        current_item: row.try_get("current_item")?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

#[async_trait]
impl WorkerRegistry for SqliteWorkerRegistry {
    async fn register(&self, info: WorkerInfo) -> CoordinationResult<WorkerRecord> {
        let record = WorkerRecord::from_info(info, Utc::now());
        let now = timestamp(record.started_at);
        let outcome = sqlx::query(
            "INSERT INTO workers (worker_id, host, pid, capabilities, pool_id, started_at, status, last_heartbeat, current_item, metadata)
             VALUES (?, ?, ?, ?, ?, ?, 'active', ?, NULL, ?)
             ON CONFLICT (worker_id) DO UPDATE SET
                 host = excluded.host,
                 pid = excluded.pid,
                 capabilities = excluded.capabilities,
                 pool_id = excluded.pool_id,
                 started_at = excluded.started_at,
                 status = 'active',
                 last_heartbeat = excluded.last_heartbeat,
                 current_item = NULL
             WHERE workers.status != 'dead'",
        )
        .bind(&record.worker_id)
        .bind(&record.host)
        .bind(record.pid as i64)
        .bind(serde_json::to_string(&record.capabilities)?)
        .bind(&record.pool_id)
        .bind(&now)
        .bind(&now)
        .bind(serde_json::to_string(&record.metadata)?)
        .execute(&self.db.writer)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(CoordinationError::WorkerDead(record.worker_id));
        }
        Ok(record)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        update: HeartbeatUpdate,
    ) -> CoordinationResult<WorkerRecord> {
        let metadata = update
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let row = sqlx::query(
            "UPDATE workers
             SET last_heartbeat = ?, current_item = ?, metadata = COALESCE(?, metadata)
             WHERE worker_id = ? AND status != 'dead'
             RETURNING *",
        )
        .bind(timestamp(Utc::now()))
        .bind(update.current_item)
        .bind(metadata)
        .bind(worker_id)
        .fetch_optional(&self.db.writer)
        .await?;

        match row {
            Some(row) => worker_from_row(&row),
            None => Err(self.rejection(worker_id).await),
        }
    }

    async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> CoordinationResult<()> {
        let outcome = sqlx::query(
            "UPDATE workers SET status = ?
             WHERE worker_id = ? AND (status != 'dead' OR ? = 'dead')",
        )
        .bind(status.as_str())
        .bind(worker_id)
        .bind(status.as_str())
        .execute(&self.db.writer)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(self.rejection(worker_id).await);
        }
        Ok(())
    }

    async fn list(&self, filter: &WorkerFilter) -> CoordinationResult<Vec<WorkerRecord>> {
        let now = Utc::now();
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM workers WHERE 1 = 1");
        if !filter.statuses.is_empty() {
            query.push(" AND status IN (");
            let mut separated = query.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(pool_id) = &filter.pool_id {
            query.push(" AND pool_id = ").push_bind(pool_id.clone());
        }
        if let Some(cutoff) = filter.stale_cutoff(now) {
            query.push(" AND last_heartbeat < ").push_bind(timestamp(cutoff));
        }
        query.push(" ORDER BY rowid");

        let rows = query.build().fetch_all(&self.db.reader).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = worker_from_row(row)?;
            // Capabilities are a JSON column; the final match runs here.
            if filter.matches(&record, now) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn get(&self, worker_id: &str) -> CoordinationResult<Option<WorkerRecord>> {
        let row = sqlx::query("SELECT * FROM workers WHERE worker_id = ?")
            .bind(worker_id)
            .fetch_optional(&self.db.reader)
            .await?;
        row.as_ref().map(worker_from_row).transpose()
    }
}
