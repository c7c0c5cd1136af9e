//! Distributed work coordination: a durable work pool, a worker liveness registry,
//! and the checker / worker / reaper control loops composed from them.
//!
//! Every cross-process mutation goes through the atomic operations exposed by
//! [`WorkPool`] and [`WorkerRegistry`]. Backends are chosen by
//! [`open_coordination`] from the configured type tag.

pub mod checker;
pub mod pool;
pub mod reaper;
pub mod registry;
pub mod sqlite;
pub mod worker;

pub use checker::{CheckReport, Checker, CheckerSettings, TaskSpawner, WorkerSpawner};
pub use pool::{MemoryWorkPool, WorkItem, WorkItemStatus, WorkPool};
pub use reaper::{ReapReport, Reaper, ReaperSettings};
pub use registry::{
    HeartbeatUpdate, MemoryWorkerRegistry, WorkerFilter, WorkerInfo, WorkerRecord,
    WorkerRegistry, WorkerStatus,
};
pub use sqlite::{DatabasePool, SqliteWorkPool, SqliteWorkerRegistry};
pub use worker::{JobProcessor, Worker, WorkerExit, WorkerSettings, WorkflowJobProcessor};

use crate::core::config::{CoordinationBackend, CoordinationConfig};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("work item {item_id} is no longer claimed by worker {worker_id}")]
    ClaimLost { item_id: String, worker_id: String },

    #[error("worker {0} has been marked dead")]
    WorkerDead(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for CoordinationError {
    fn from(e: sqlx::Error) -> Self {
        CoordinationError::Storage(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for CoordinationError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        CoordinationError::Storage(format!("migration failed: {e}"))
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(e: serde_json::Error) -> Self {
        CoordinationError::Serialization(e.to_string())
    }
}

pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// The pair of shared primitives every coordination role is built from.
#[derive(Clone)]
pub struct Coordination {
    pub pool: Arc<dyn WorkPool>,
    pub registry: Arc<dyn WorkerRegistry>,
}

/// Open the configured coordination backend.
pub async fn open_coordination(config: &CoordinationConfig) -> CoordinationResult<Coordination> {
    match config.backend {
        CoordinationBackend::Memory => Ok(Coordination {
            pool: Arc::new(MemoryWorkPool::new(&config.pool_id)),
            registry: Arc::new(MemoryWorkerRegistry::new()),
        }),
        CoordinationBackend::Sqlite => {
            ensure_database_dir(&config.database_url)?;
            let db = DatabasePool::new(&config.database_url).await?;
            tracing::debug!(database_url = %config.database_url, pool_id = %config.pool_id, "opened sqlite coordination backend");
            Ok(Coordination {
                pool: Arc::new(SqliteWorkPool::new(db.clone(), &config.pool_id)),
                registry: Arc::new(SqliteWorkerRegistry::new(db)),
            })
        }
    }
}

/// SQLite creates the database file but not its directory.
fn ensure_database_dir(database_url: &str) -> CoordinationResult<()> {
    let Some(rest) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }
    match std::path::Path::new(path).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir).map_err(|e| {
            CoordinationError::Storage(format!("cannot create {}: {}", dir.display(), e))
        }),
        _ => Ok(()),
    }
}

/// Fixed-width timestamp text so lexical order matches time order in storage.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(text: &str) -> CoordinationResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoordinationError::Serialization(format!("invalid timestamp '{text}': {e}")))
}
