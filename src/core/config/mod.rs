pub mod loader;
pub mod validation;

pub use loader::ConfigLoader;
pub use validation::ConfigValidator;

use crate::core::coordination::{CheckerSettings, ReaperSettings, WorkerSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the workspace configuration file.
pub const CONFIG_FILE_NAME: &str = "statewright.toml";

/// Top-level configuration loaded from statewright.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatewrightConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub coordination: CoordinationConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,

    #[serde(default)]
    pub checker: CheckerConfig,
}

impl StatewrightConfig {
    /// Anchor every relative path (and a relative sqlite file) at `workspace`.
    pub fn resolve_paths(&mut self, workspace: &Path) {
        if self.runtime.workflows_dir.is_relative() {
            self.runtime.workflows_dir = workspace.join(&self.runtime.workflows_dir);
        }
        if self.checkpoint.path.is_relative() {
            self.checkpoint.path = workspace.join(&self.checkpoint.path);
        }
        self.coordination.database_url =
            resolve_sqlite_url(&self.coordination.database_url, workspace);
    }
}

fn resolve_sqlite_url(url: &str, workspace: &Path) -> String {
    let Some(rest) = url.strip_prefix("sqlite://") else {
        return url.to_string();
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    if path.is_empty() || path == ":memory:" || Path::new(path).is_absolute() {
        return url.to_string();
    }
    let joined = format!("sqlite://{}", workspace.join(path).display());
    match query {
        Some(query) => format!("{}?{}", joined, query),
        None => joined,
    }
}

/// Where workflow documents are looked up by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workflows_dir: default_workflows_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    File,
    Memory,
}

impl std::str::FromStr for CheckpointBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(CheckpointBackend::File),
            "memory" => Ok(CheckpointBackend::Memory),
            other => Err(format!("unknown checkpoint backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,

    /// Directory holding one JSON snapshot per execution.
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,

    /// Keep superseded snapshots next to the current one.
    #[serde(default)]
    pub keep_history: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            backend: CheckpointBackend::default(),
            path: default_checkpoint_path(),
            keep_history: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::str::FromStr for CoordinationBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(CoordinationBackend::Sqlite),
            "memory" => Ok(CoordinationBackend::Memory),
            other => Err(format!("unknown coordination backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub backend: CoordinationBackend,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Work pool namespace shared by checkers and workers.
    #[serde(default = "default_pool_id")]
    pub pool_id: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        CoordinationConfig {
            backend: CoordinationBackend::default(),
            database_url: default_database_url(),
            pool_id: default_pool_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval", with = "duration_format")]
    pub poll_interval: Duration,

    #[serde(default = "default_heartbeat_interval", with = "duration_format")]
    pub heartbeat_interval: Duration,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Retry budget given to items pushed from the command line.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            poll_interval: default_poll_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            capabilities: Vec::new(),
            max_retries: default_max_retries(),
        }
    }
}

impl WorkerConfig {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            capabilities: self.capabilities.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval", with = "duration_format")]
    pub interval: Duration,

    /// Heartbeat age after which a worker counts as dead.
    #[serde(default = "default_stale_after", with = "duration_format")]
    pub stale_after: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            interval: default_reaper_interval(),
            stale_after: default_stale_after(),
        }
    }
}

impl ReaperConfig {
    pub fn settings(&self) -> ReaperSettings {
        ReaperSettings {
            interval: self.interval,
            stale_after: self.stale_after,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    #[serde(default = "default_checker_interval", with = "duration_format")]
    pub interval: Duration,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_items_per_worker")]
    pub items_per_worker: usize,

    #[serde(default = "default_spawn_grace", with = "duration_format")]
    pub spawn_grace: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        CheckerConfig {
            interval: default_checker_interval(),
            max_workers: default_max_workers(),
            items_per_worker: default_items_per_worker(),
            spawn_grace: default_spawn_grace(),
        }
    }
}

impl CheckerConfig {
    pub fn settings(&self) -> CheckerSettings {
        CheckerSettings {
            interval: self.interval,
            max_workers: self.max_workers,
            items_per_worker: self.items_per_worker,
            spawn_grace: self.spawn_grace,
        }
    }
}

/// Durations are written the humantime way: "500ms", "5s", "2m".
mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".statewright/checkpoints")
}

fn default_database_url() -> String {
    "sqlite://.statewright/coordination.db".to_string()
}

fn default_pool_id() -> String {
    "default".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    3
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(30)
}

fn default_checker_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_workers() -> usize {
    4
}

fn default_items_per_worker() -> usize {
    10
}

fn default_spawn_grace() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humantime_durations() {
        let config: StatewrightConfig = toml::from_str(
            r#"
[worker]
poll_interval = "250ms"
heartbeat_interval = "2s"

[reaper]
stale_after = "1m"
"#,
        )
        .unwrap();
        assert_eq!(config.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(config.worker.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.reaper.stale_after, Duration::from_secs(60));
        assert_eq!(config.reaper.interval, Duration::from_secs(10));
    }

    #[test]
    fn resolves_relative_paths_against_workspace() {
        let mut config = StatewrightConfig::default();
        config.resolve_paths(Path::new("/srv/app"));
        assert_eq!(config.runtime.workflows_dir, PathBuf::from("/srv/app/workflows"));
        assert_eq!(
            config.checkpoint.path,
            PathBuf::from("/srv/app/.statewright/checkpoints")
        );
        assert_eq!(
            config.coordination.database_url,
            "sqlite:///srv/app/.statewright/coordination.db"
        );
    }

    #[test]
    fn leaves_memory_and_absolute_sqlite_urls_alone() {
        let ws = Path::new("/ws");
        assert_eq!(resolve_sqlite_url("sqlite::memory:", ws), "sqlite::memory:");
        assert_eq!(resolve_sqlite_url("sqlite:///tmp/x.db", ws), "sqlite:///tmp/x.db");
        assert_eq!(
            resolve_sqlite_url("sqlite://db/c.db?mode=rwc", ws),
            "sqlite:///ws/db/c.db?mode=rwc"
        );
    }
}
