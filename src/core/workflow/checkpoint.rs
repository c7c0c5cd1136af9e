#![allow(clippy::result_large_err)] // Checkpoint APIs return AppError so persistence failures keep their structured code.

use crate::core::config::{CheckpointBackend, CheckpointConfig};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::state::ExecutionSnapshot;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

const HISTORY_DIR: &str = "history";

/// Save / load / delete / list snapshots by string key (conventionally the execution id).
///
/// Each execution id has exactly one writer, the run itself, so implementations need
/// atomic replacement of a single key but no cross-key locking.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, key: &str, snapshot: &ExecutionSnapshot) -> Result<(), AppError>;
    async fn load(&self, key: &str) -> Result<Option<ExecutionSnapshot>, AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError>;
}

fn persistence_error(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::PersistenceError, message).with_code("WFG-CKPT-001")
}

/// Keys become file names, so only a conservative character set is accepted.
pub fn validate_checkpoint_key(key: &str) -> Result<(), AppError> {
    let valid = !key.is_empty()
        && !key.contains("..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid {
        return Err(AppError::new(
            ErrorCategory::ValidationError,
            format!("checkpoint key '{}' contains invalid characters for filesystem use", key),
        )
        .with_code("WFG-CKPT-002"));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    snapshots: DashMap<String, ExecutionSnapshot>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, key: &str, snapshot: &ExecutionSnapshot) -> Result<(), AppError> {
        self.snapshots.insert(key.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<ExecutionSnapshot>, AppError> {
        Ok(self.snapshots.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.snapshots.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let mut keys: Vec<String> = self
            .snapshots
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// One JSON file per key under a root directory.
pub struct FileCheckpointStore {
    root: PathBuf,
    keep_history: bool,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>, keep_history: bool) -> Self {
        FileCheckpointStore {
            root: root.into(),
            keep_history,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AppError> {
        validate_checkpoint_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    fn history_dir(&self, key: &str) -> PathBuf {
        self.root.join(HISTORY_DIR).join(key)
    }
}

async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            persistence_error(format!(
                "failed to create directory {}: {}",
                parent.display(),
                err
            ))
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data)
        .await
        .map_err(|err| persistence_error(format!("failed to write {}: {}", tmp_path.display(), err)))?;
    fs::rename(&tmp_path, path).await.map_err(|err| {
        persistence_error(format!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, key: &str, snapshot: &ExecutionSnapshot) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to serialize snapshot {}: {}", key, err),
            )
        })?;
        atomic_write(&path, &bytes).await?;
        if self.keep_history {
            let history = self
                .history_dir(key)
                .join(format!("{:06}.json", snapshot.step));
            atomic_write(&history, &bytes).await?;
        }
        tracing::debug!(execution_id = %key, step = snapshot.step, state = %snapshot.current_state, "checkpoint saved");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<ExecutionSnapshot>, AppError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(persistence_error(format!(
                    "failed to read {}: {}",
                    path.display(),
                    err
                )))
            }
        };
        let snapshot = serde_json::from_slice(&bytes).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to parse {}: {}", path.display(), err),
            )
            .with_code("WFG-CKPT-003")
        })?;
        Ok(Some(snapshot))
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(persistence_error(format!(
                    "failed to delete {}: {}",
                    path.display(),
                    err
                )))
            }
        }
        let history = self.history_dir(key);
        if fs::try_exists(&history).await.unwrap_or(false) {
            fs::remove_dir_all(&history).await.map_err(|err| {
                persistence_error(format!("failed to delete {}: {}", history.display(), err))
            })?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(persistence_error(format!(
                    "failed to list {}: {}",
                    self.root.display(),
                    err
                )))
            }
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| persistence_error(format!("failed to list checkpoints: {err}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if stem.starts_with(prefix) {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Open the configured checkpoint backend.
pub fn open_checkpoint_store(config: &CheckpointConfig) -> Arc<dyn CheckpointStore> {
    match config.backend {
        CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
        CheckpointBackend::File => Arc::new(FileCheckpointStore::new(
            config.path.clone(),
            config.keep_history,
        )),
    }
}

/// Delete terminal snapshots last updated before `older_than` ago. Returns the removed keys.
pub async fn prune_terminal(
    store: &dyn CheckpointStore,
    older_than: Duration,
) -> Result<Vec<String>, AppError> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(older_than).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("prune window out of range: {err}"),
            )
        })?;
    let mut removed = Vec::new();
    for key in store.list("").await? {
        let Some(snapshot) = store.load(&key).await? else {
            continue;
        };
        if snapshot.is_terminal() && snapshot.updated_at < cutoff {
            store.delete(&key).await?;
            removed.push(key);
        }
    }
    if !removed.is_empty() {
        tracing::info!(count = removed.len(), "pruned terminal checkpoints");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionStatus;
    use crate::core::workflow::state::{LaunchIntent, UsageTotals, SNAPSHOT_FORMAT_VERSION};
    use serde_json::json;

    fn snapshot(id: &str, status: ExecutionStatus) -> ExecutionSnapshot {
        let now = Utc::now();
        ExecutionSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
            execution_id: id.to_string(),
            workflow_name: "review".to_string(),
            workflow_hash: "abc".to_string(),
            current_state: "check".to_string(),
            context: json!({"score": 5, "tags": ["a", "b"]}),
            step: 3,
            status,
            state_in_progress: false,
            created_at: now,
            updated_at: now,
            final_output: None,
            usage: UsageTotals {
                input_tokens: 3,
                output_tokens: 4,
                calls: 1,
                cost: 0.25,
            },
            parent_execution_id: Some("parent".to_string()),
            launch_intents: vec![LaunchIntent {
                id: format!("{id}-start-1"),
                workflow: "audit".to_string(),
                input: json!({"x": 1}),
                launched: false,
            }],
            error: None,
        }
    }

    #[tokio::test]
    async fn file_store_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), false);
        let saved = snapshot("run-1", ExecutionStatus::Running);
        store.save("run-1", &saved).await.unwrap();
        let loaded = store.load("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(!dir.path().join("run-1.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_lists_by_prefix_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), true);
        for key in ["b-1", "a-2", "a-1"] {
            store
                .save(key, &snapshot(key, ExecutionStatus::Running))
                .await
                .unwrap();
        }
        assert_eq!(store.list("a-").await.unwrap(), vec!["a-1", "a-2"]);
        assert!(dir.path().join("history/a-1/000003.json").exists());

        store.delete("a-1").await.unwrap();
        store.delete("a-1").await.unwrap();
        assert_eq!(store.list("").await.unwrap(), vec!["a-2", "b-1"]);
        assert!(!dir.path().join("history/a-1").exists());
        assert!(store.load("a-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), false);
        let err = store
            .save("../escape", &snapshot("x", ExecutionStatus::Running))
            .await
            .unwrap_err();
        assert_eq!(err.code, "WFG-CKPT-002");
    }

    #[tokio::test]
    async fn prune_removes_only_old_terminal_snapshots() {
        let store = MemoryCheckpointStore::new();
        let mut old_done = snapshot("old-done", ExecutionStatus::Completed);
        old_done.updated_at = Utc::now() - chrono::Duration::days(10);
        let mut old_running = snapshot("old-running", ExecutionStatus::Running);
        old_running.updated_at = Utc::now() - chrono::Duration::days(10);
        let fresh_done = snapshot("fresh-done", ExecutionStatus::Failed);
        for s in [&old_done, &old_running, &fresh_done] {
            store.save(&s.execution_id, s).await.unwrap();
        }

        let removed = prune_terminal(&store, Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, vec!["old-done".to_string()]);
        assert_eq!(store.list("").await.unwrap(), vec!["fresh-done", "old-running"]);
    }
}
