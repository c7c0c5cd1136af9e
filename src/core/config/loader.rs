#![allow(clippy::result_large_err)]

use super::{StatewrightConfig, CONFIG_FILE_NAME};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load `workspace/statewright.toml`, falling back to defaults when it is missing.
    /// Environment variables override file values and relative paths are anchored at
    /// the workspace.
    pub fn load_from_workspace(workspace_path: &Path) -> Result<StatewrightConfig, AppError> {
        let config_path = workspace_path.join(CONFIG_FILE_NAME);
        let mut config = Self::load_from_file(&config_path)?.unwrap_or_default();

        Self::apply_env_overrides(&mut config);
        config.resolve_paths(workspace_path);

        Ok(config)
    }

    /// Returns Ok(None) if the file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<StatewrightConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
            .with_code("CFG-001")
        })?;

        let config: StatewrightConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("CFG-002")
        })?;

        Ok(Some(config))
    }

    /// Unparseable values are ignored and the file or default value stays.
    fn apply_env_overrides(config: &mut StatewrightConfig) {
        if let Ok(dir) = env::var("STATEWRIGHT_WORKFLOWS_DIR") {
            config.runtime.workflows_dir = PathBuf::from(dir);
        }

        if let Some(backend) = parsed_var("STATEWRIGHT_CHECKPOINT_BACKEND") {
            config.checkpoint.backend = backend;
        }
        if let Ok(path) = env::var("STATEWRIGHT_CHECKPOINT_PATH") {
            config.checkpoint.path = PathBuf::from(path);
        }
        if let Some(keep) = parsed_var("STATEWRIGHT_CHECKPOINT_KEEP_HISTORY") {
            config.checkpoint.keep_history = keep;
        }

        if let Some(backend) = parsed_var("STATEWRIGHT_COORDINATION_BACKEND") {
            config.coordination.backend = backend;
        }
        if let Ok(url) = env::var("STATEWRIGHT_DATABASE_URL") {
            config.coordination.database_url = url;
        }
        if let Ok(pool_id) = env::var("STATEWRIGHT_POOL_ID") {
            config.coordination.pool_id = pool_id;
        }

        if let Some(interval) = duration_var("STATEWRIGHT_WORKER_POLL_INTERVAL") {
            config.worker.poll_interval = interval;
        }
        if let Some(interval) = duration_var("STATEWRIGHT_WORKER_HEARTBEAT_INTERVAL") {
            config.worker.heartbeat_interval = interval;
        }
        if let Ok(capabilities) = env::var("STATEWRIGHT_WORKER_CAPABILITIES") {
            config.worker.capabilities = capabilities
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(stale) = duration_var("STATEWRIGHT_REAPER_STALE_AFTER") {
            config.reaper.stale_after = stale;
        }

        if let Some(max_workers) = parsed_var("STATEWRIGHT_CHECKER_MAX_WORKERS") {
            config.checker.max_workers = max_workers;
        }
        if let Some(per_worker) = parsed_var("STATEWRIGHT_CHECKER_ITEMS_PER_WORKER") {
            config.checker.items_per_worker = per_worker;
        }
    }

    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "STATEWRIGHT_WORKFLOWS_DIR - Directory searched for workflow documents (default: workflows)",
            "STATEWRIGHT_CHECKPOINT_BACKEND - file or memory (default: file)",
            "STATEWRIGHT_CHECKPOINT_PATH - Snapshot directory (default: .statewright/checkpoints)",
            "STATEWRIGHT_CHECKPOINT_KEEP_HISTORY - Keep superseded snapshots (true/false)",
            "STATEWRIGHT_COORDINATION_BACKEND - sqlite or memory (default: sqlite)",
            "STATEWRIGHT_DATABASE_URL - Coordination database (default: sqlite://.statewright/coordination.db)",
            "STATEWRIGHT_POOL_ID - Work pool namespace (default: default)",
            "STATEWRIGHT_WORKER_POLL_INTERVAL - Idle poll interval, e.g. 500ms",
            "STATEWRIGHT_WORKER_HEARTBEAT_INTERVAL - Heartbeat interval, e.g. 5s",
            "STATEWRIGHT_WORKER_CAPABILITIES - Comma separated capability tags",
            "STATEWRIGHT_REAPER_STALE_AFTER - Heartbeat age that marks a worker dead, e.g. 30s",
            "STATEWRIGHT_CHECKER_MAX_WORKERS - Upper bound on local workers (default: 4)",
            "STATEWRIGHT_CHECKER_ITEMS_PER_WORKER - Pending items per worker (default: 10)",
        ]
    }
}

fn parsed_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

fn duration_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|raw| humantime::parse_duration(raw.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CheckpointBackend, CoordinationBackend};
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_statewright_env() {
        for doc in ConfigLoader::env_var_documentation() {
            if let Some((name, _)) = doc.split_once(' ') {
                env::remove_var(name);
            }
        }
    }

    #[test]
    #[serial]
    fn test_load_config_nonexistent() {
        clear_statewright_env();
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
        assert_eq!(config.checkpoint.backend, CheckpointBackend::File);
        assert_eq!(config.coordination.pool_id, "default");
        assert_eq!(
            config.checkpoint.path,
            temp_dir.path().join(".statewright/checkpoints")
        );
    }

    #[test]
    #[serial]
    fn test_load_config_valid() {
        clear_statewright_env();
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("statewright.toml"),
            r#"
[checkpoint]
backend = "memory"

[coordination]
backend = "memory"
pool_id = "reviews"

[worker]
capabilities = ["gpu"]
heartbeat_interval = "3s"

[checker]
max_workers = 2
"#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Memory);
        assert_eq!(config.coordination.backend, CoordinationBackend::Memory);
        assert_eq!(config.coordination.pool_id, "reviews");
        assert_eq!(config.worker.capabilities, vec!["gpu".to_string()]);
        assert_eq!(config.worker.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.checker.max_workers, 2);
        assert_eq!(config.checker.items_per_worker, 10);
    }

    #[test]
    #[serial]
    fn test_load_config_invalid() {
        clear_statewright_env();
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("statewright.toml"), "invalid toml {{").unwrap();

        let err = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap_err();
        assert_eq!(err.category, ErrorCategory::ValidationError);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_statewright_env();
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("statewright.toml"),
            r#"
[coordination]
pool_id = "from-file"
"#,
        )
        .unwrap();

        env::set_var("STATEWRIGHT_POOL_ID", "from-env");
        env::set_var("STATEWRIGHT_CHECKPOINT_BACKEND", "memory");
        env::set_var("STATEWRIGHT_WORKER_POLL_INTERVAL", "250ms");
        env::set_var("STATEWRIGHT_WORKER_CAPABILITIES", "gpu, linux,");

        let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
        assert_eq!(config.coordination.pool_id, "from-env");
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Memory);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.capabilities, vec!["gpu", "linux"]);

        clear_statewright_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env_var_values() {
        clear_statewright_env();
        let temp_dir = TempDir::new().unwrap();

        env::set_var("STATEWRIGHT_CHECKER_MAX_WORKERS", "many");
        env::set_var("STATEWRIGHT_REAPER_STALE_AFTER", "soon");
        env::set_var("STATEWRIGHT_COORDINATION_BACKEND", "postgres");

        let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
        assert_eq!(config.checker.max_workers, 4);
        assert_eq!(config.reaper.stale_after, Duration::from_secs(30));
        assert_eq!(config.coordination.backend, CoordinationBackend::Sqlite);

        clear_statewright_env();
    }

    #[test]
    fn test_env_var_documentation() {
        let docs = ConfigLoader::env_var_documentation();
        assert!(docs.iter().all(|doc| doc.starts_with("STATEWRIGHT_")));
        assert!(docs.iter().any(|doc| doc.contains("STATEWRIGHT_DATABASE_URL")));
    }
}
