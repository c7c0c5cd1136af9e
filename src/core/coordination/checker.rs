use super::registry::{WorkerFilter, WorkerInfo, WorkerStatus};
use super::worker::{JobProcessor, Worker, WorkerSettings};
use super::{Coordination, CoordinationResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Capability for starting one more worker. Returns the id the worker will register under.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn_worker(&self) -> CoordinationResult<String>;
}

/// Spawns workers as tasks in the current runtime.
pub struct TaskSpawner {
    coordination: Coordination,
    processor: Arc<dyn JobProcessor>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSpawner {
    pub fn new(
        coordination: Coordination,
        processor: Arc<dyn JobProcessor>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        TaskSpawner {
            coordination,
            processor,
            settings,
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every spawned worker to exit. Callers cancel the shared token first.
    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker task panicked");
            }
        }
    }
}

#[async_trait]
impl WorkerSpawner for TaskSpawner {
    async fn spawn_worker(&self) -> CoordinationResult<String> {
        let info = WorkerInfo::local(
            self.coordination.pool.pool_id(),
            self.settings.capabilities.clone(),
        );
        let worker_id = info.worker_id.clone();
        let worker = Worker::new(&self.coordination, self.processor.clone(), self.settings.clone())
            .with_info(info);
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            match worker.run(cancel).await {
                Ok(exit) => tracing::debug!(worker_id = %worker.worker_id(), ?exit, "spawned worker exited"),
                Err(e) => tracing::error!(worker_id = %worker.worker_id(), error = %e, "spawned worker failed"),
            }
        });
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(worker_id)
    }
}

#[derive(Debug, Clone)]
pub struct CheckerSettings {
    pub interval: Duration,
    pub max_workers: usize,
    pub items_per_worker: usize,
    /// How long a spawned worker may take to register before it stops counting.
    pub spawn_grace: Duration,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        CheckerSettings {
            interval: Duration::from_secs(5),
            max_workers: 4,
            items_per_worker: 10,
            spawn_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub pending: u64,
    pub active: usize,
    pub starting: usize,
    pub desired: usize,
    pub spawned: Vec<String>,
}

/// Compares backlog against live workers and spawns the shortfall.
///
/// Calling `check_once` repeatedly is safe: spawns that have not registered yet
/// still count toward the current total until `spawn_grace` elapses.
pub struct Checker {
    coordination: Coordination,
    spawner: Arc<dyn WorkerSpawner>,
    settings: CheckerSettings,
    starting: Mutex<HashMap<String, Instant>>,
}

impl Checker {
    pub fn new(
        coordination: Coordination,
        spawner: Arc<dyn WorkerSpawner>,
        settings: CheckerSettings,
    ) -> Self {
        Checker {
            coordination,
            spawner,
            settings,
            starting: Mutex::new(HashMap::new()),
        }
    }

    pub fn desired_workers(&self, pending: u64) -> usize {
        let per_worker = self.settings.items_per_worker.max(1) as u64;
        let wanted = pending.div_ceil(per_worker);
        wanted.min(self.settings.max_workers as u64) as usize
    }

    pub async fn check_once(&self) -> CoordinationResult<CheckReport> {
        let pending = self.coordination.pool.size().await?;
        let filter = WorkerFilter {
            statuses: vec![WorkerStatus::Active],
            pool_id: Some(self.coordination.pool.pool_id().to_string()),
            ..Default::default()
        };
        let active = self.coordination.registry.list(&filter).await?;

        let mut starting = self.starting.lock().await;
        let grace = self.settings.spawn_grace;
        starting.retain(|worker_id, spawned_at| {
            spawned_at.elapsed() < grace && !active.iter().any(|w| &w.worker_id == worker_id)
        });

        let desired = self.desired_workers(pending);
        let current = active.len() + starting.len();
        let mut spawned = Vec::new();
        for _ in current..desired {
            let worker_id = self.spawner.spawn_worker().await?;
            starting.insert(worker_id.clone(), Instant::now());
            spawned.push(worker_id);
        }

        if !spawned.is_empty() {
            tracing::info!(pending, active = active.len(), desired, spawned = spawned.len(), "spawned workers for backlog");
        }
        Ok(CheckReport {
            pending,
            active: active.len(),
            starting: starting.len() - spawned.len(),
            desired,
            spawned,
        })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        tracing::warn!(error = %e, "checker pass failed");
                    }
                }
            }
        }
        tracing::info!("checker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coordination::{MemoryWorkPool, MemoryWorkerRegistry, WorkerRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out ids without starting anything, optionally registering them.
    struct RecordingSpawner {
        registry: Arc<dyn WorkerRegistry>,
        register: bool,
        count: AtomicUsize,
    }

    #[async_trait]
    impl WorkerSpawner for RecordingSpawner {
        async fn spawn_worker(&self) -> CoordinationResult<String> {
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            let mut info = WorkerInfo::local("default", vec![]);
            info.worker_id = format!("spawned-{n}");
            if self.register {
                self.registry.register(info.clone()).await?;
            }
            Ok(info.worker_id)
        }
    }

    fn setup(register: bool) -> (Coordination, Arc<RecordingSpawner>) {
        let registry: Arc<dyn WorkerRegistry> = Arc::new(MemoryWorkerRegistry::new());
        let coordination = Coordination {
            pool: Arc::new(MemoryWorkPool::new("default")),
            registry: registry.clone(),
        };
        let spawner = Arc::new(RecordingSpawner {
            registry,
            register,
            count: AtomicUsize::new(0),
        });
        (coordination, spawner)
    }

    fn settings() -> CheckerSettings {
        CheckerSettings {
            interval: Duration::from_millis(10),
            max_workers: 3,
            items_per_worker: 2,
            spawn_grace: Duration::from_secs(60),
        }
    }

    #[test]
    fn desired_is_capped_ceiling() {
        let (coordination, spawner) = setup(false);
        let checker = Checker::new(coordination, spawner, settings());
        assert_eq!(checker.desired_workers(0), 0);
        assert_eq!(checker.desired_workers(1), 1);
        assert_eq!(checker.desired_workers(3), 2);
        assert_eq!(checker.desired_workers(100), 3);
    }

    #[tokio::test]
    async fn repeated_checks_do_not_overspawn() {
        let (coordination, spawner) = setup(false);
        for n in 0..3 {
            coordination.pool.push(json!({"n": n}), 3).await.unwrap();
        }
        let checker = Checker::new(coordination, spawner.clone(), settings());

        let first = checker.check_once().await.unwrap();
        assert_eq!(first.desired, 2);
        assert_eq!(first.spawned.len(), 2);

        let second = checker.check_once().await.unwrap();
        assert!(second.spawned.is_empty());
        assert_eq!(second.starting, 2);
        assert_eq!(spawner.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn registered_workers_count_as_active() {
        let (coordination, spawner) = setup(true);
        for n in 0..6 {
            coordination.pool.push(json!({"n": n}), 3).await.unwrap();
        }
        let checker = Checker::new(coordination, spawner.clone(), settings());

        assert_eq!(checker.check_once().await.unwrap().spawned.len(), 3);
        let report = checker.check_once().await.unwrap();
        assert_eq!(report.active, 3);
        assert_eq!(report.starting, 0);
        assert!(report.spawned.is_empty());
    }

    struct Echo;

    #[async_trait]
    impl JobProcessor for Echo {
        async fn process(
            &self,
            item: &crate::core::coordination::WorkItem,
        ) -> Result<serde_json::Value, crate::core::AppError> {
            Ok(item.payload.clone())
        }
    }

    #[tokio::test]
    async fn task_spawner_drops_exited_workers() {
        let (coordination, _) = setup(false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spawner = TaskSpawner::new(
            coordination,
            Arc::new(Echo),
            WorkerSettings {
                poll_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_millis(20),
                capabilities: vec![],
            },
            cancel,
        );

        for _ in 0..3 {
            spawner.spawn_worker().await.unwrap();
            for _ in 0..200 {
                if spawner.handles.lock().await.iter().all(|h| h.is_finished()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        spawner.spawn_worker().await.unwrap();
        assert_eq!(spawner.handles.lock().await.len(), 1);
        spawner.join().await;
        assert!(spawner.handles.lock().await.is_empty());
    }
}
