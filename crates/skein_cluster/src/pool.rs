//! Worker pool: several workers per shard under one shutdown token.

use crate::config::WorkerConfig;
use crate::worker::{Worker, WorkerError, WorkerStats};
use skein_core::WorkerId;
use skein_runtime::{Engine, Telemetry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct Running {
    id: WorkerId,
    shard: String,
    handle: JoinHandle<WorkerStats>,
}

/// Pool of polling workers sharing one engine
pub struct WorkerPool {
    engine: Arc<Engine>,
    shutdown: CancellationToken,
    workers: Vec<Running>,
}

impl WorkerPool {
    /// Create an empty pool
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Engine the workers drive
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of workers started
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Check if no worker was started
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Start one worker
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn spawn(&mut self, config: WorkerConfig) -> Result<WorkerId, WorkerError> {
        let worker = Worker::new(Arc::clone(&self.engine), config)?;
        let id = worker.id();
        let shard = worker.shard().to_string();
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(async move { worker.run(token).await });
        self.workers.push(Running { id, shard, handle });
        Ok(id)
    }

    /// Start `per_shard` workers on every shard in `shards`
    ///
    /// Each worker copies `template` with its shard replaced.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a derived configuration does not validate
    pub fn spawn_per_shard(
        &mut self,
        shards: &[String],
        per_shard: usize,
        template: &WorkerConfig,
    ) -> Result<Vec<WorkerId>, WorkerError> {
        let mut ids = Vec::with_capacity(shards.len() * per_shard);
        for shard in shards {
            for _ in 0..per_shard {
                ids.push(self.spawn(template.clone().with_shard(shard.as_str()))?);
            }
            info!(shard = %shard, workers = per_shard, "shard workers started");
        }
        Ok(ids)
    }

    /// Wait until no step is Pending or Running, checking every `every`
    ///
    /// Returns `None` if the pool was shut down or `deadline` passed first.
    ///
    /// # Errors
    ///
    /// Returns error if telemetry cannot be read
    pub async fn wait_idle(
        &self,
        every: Duration,
        deadline: Duration,
    ) -> Result<Option<Telemetry>, WorkerError> {
        let settled = async {
            loop {
                let telemetry = self.engine.telemetry().await?;
                if telemetry.open_steps() == 0 {
                    return Ok::<_, WorkerError>(telemetry);
                }
                tokio::time::sleep(every).await;
            }
        };

        tokio::select! {
            () = self.shutdown.cancelled() => Ok(None),
            result = tokio::time::timeout(deadline, settled) => match result {
                Ok(telemetry) => telemetry.map(Some),
                Err(_) => Ok(None),
            },
        }
    }

    /// Cancel every worker and wait for their current cycles to finish
    ///
    /// # Errors
    ///
    /// Returns `TaskFailed` if a worker task panicked
    pub async fn shutdown(self) -> Result<Vec<WorkerStats>, WorkerError> {
        self.shutdown.cancel();
        let (meta, handles): (Vec<_>, Vec<_>) = self
            .workers
            .into_iter()
            .map(|running| ((running.id, running.shard), running.handle))
            .unzip();

        let mut stats = Vec::with_capacity(handles.len());
        for ((id, shard), joined) in meta.into_iter().zip(futures::future::join_all(handles).await) {
            let worker_stats = joined.map_err(|err| {
                WorkerError::TaskFailed(format!("worker {} on {}: {}", id, shard, err))
            })?;
            stats.push(worker_stats);
        }
        info!(workers = stats.len(), "worker pool stopped");
        Ok(stats)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use skein_core::{NewStep, StepState};
    use skein_runtime::{BackoffPolicy, EngineConfig, StepContext, Unit, UnitError, UnitRegistry};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Leaf;

    #[async_trait]
    impl Unit for Leaf {
        fn unit_type(&self) -> &str {
            "leaf"
        }

        async fn execute(&self, ctx: &mut StepContext) -> Result<Value, UnitError> {
            Ok(ctx.arguments.clone())
        }
    }

    struct Fan;

    #[async_trait]
    impl Unit for Fan {
        fn unit_type(&self) -> &str {
            "fan"
        }

        async fn execute(&self, ctx: &mut StepContext) -> Result<Value, UnitError> {
            for index in 0..6 {
                ctx.add_child(NewStep::new("leaf", json!({ "index": index })), index % 2);
            }
            Ok(json!({ "fanned": 6 }))
        }
    }

    async fn engine() -> Arc<Engine> {
        let registry = UnitRegistry::new()
            .with(Arc::new(Leaf))
            .unwrap()
            .with(Arc::new(Fan))
            .unwrap();
        let config = EngineConfig::new().with_backoff(BackoffPolicy::None);
        let engine = Engine::in_memory(config, registry).unwrap();
        engine.register_shard("alpha").await.unwrap();
        engine.register_shard("beta").await.unwrap();
        Arc::new(engine)
    }

    fn template() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(1))
            .with_idle_backoff(Duration::from_millis(4))
    }

    #[tokio::test]
    async fn test_pool_spawn_per_shard() {
        let mut pool = WorkerPool::new(engine().await);
        let shards = vec!["alpha".to_string(), "beta".to_string()];
        let ids = pool.spawn_per_shard(&shards, 2, &template()).unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(pool.len(), 4);

        let stats = pool.shutdown().await.unwrap();
        assert_eq!(stats.len(), 4);
        assert_eq!(stats.iter().filter(|s| s.shard == "alpha").count(), 2);
    }

    #[tokio::test]
    async fn test_pool_rejects_invalid_template() {
        let mut pool = WorkerPool::new(engine().await);
        let result = pool.spawn(template().with_max_steps_per_cycle(0));
        assert!(result.is_err());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_pool_drains_fan_out() {
        let engine = engine().await;
        let parent = engine.create_step(NewStep::new("fan", json!({}))).await.unwrap();

        let mut pool = WorkerPool::new(Arc::clone(&engine));
        let shards = vec!["alpha".to_string(), "beta".to_string()];
        pool.spawn_per_shard(&shards, 2, &template()).unwrap();

        let telemetry = pool
            .wait_idle(Duration::from_millis(2), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(telemetry.count(StepState::Completed), 7);

        let stats = pool.shutdown().await.unwrap();
        let run: u64 = stats.iter().map(|s| s.steps_run).sum();
        assert_eq!(run, 7);
        assert_eq!(engine.get_step(parent.id).await.unwrap().state, StepState::Completed);
    }

    /// Holds its step for longer than the claim lease
    #[derive(Default)]
    struct Slow {
        runs: AtomicU32,
        live: AtomicU32,
        max_live: AtomicU32,
    }

    #[async_trait]
    impl Unit for Slow {
        fn unit_type(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _ctx: &mut StepContext) -> Result<Value, UnitError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_runs_step_longer_than_lease_once() {
        let slow = Arc::new(Slow::default());
        let registry = UnitRegistry::new().with(slow.clone()).unwrap();
        let config = EngineConfig::new()
            .with_backoff(BackoffPolicy::None)
            .with_lease(Duration::from_millis(50));
        let engine = Arc::new(Engine::in_memory(config, registry).unwrap());
        engine.register_shard("alpha").await.unwrap();
        let step = engine.create_step(NewStep::new("slow", json!({}))).await.unwrap();

        let mut pool = WorkerPool::new(Arc::clone(&engine));
        pool.spawn_per_shard(&["alpha".to_string()], 2, &template()).unwrap();
        let telemetry = pool
            .wait_idle(Duration::from_millis(5), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        pool.shutdown().await.unwrap();

        assert_eq!(telemetry.count(StepState::Completed), 1);
        assert_eq!(telemetry.metrics.stale_requeued, 0);
        assert_eq!(slow.runs.load(Ordering::SeqCst), 1);
        assert_eq!(slow.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(engine.get_step(step.id).await.unwrap().state, StepState::Completed);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_none_after_shutdown() {
        let engine = engine().await;
        engine.set_can_dispatch("alpha", false).await.unwrap();
        engine.create_step(NewStep::new("leaf", json!({}))).await.unwrap();
        engine.set_can_dispatch("beta", false).await.unwrap();

        let pool = WorkerPool::new(engine);
        pool.shutdown_token().cancel();
        let waited = pool
            .wait_idle(Duration::from_millis(1), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(waited.is_none());
    }
}
