//! The public queue facade.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use actors::{
    HandlerResult, JobContext, JobHandler, SchedulerHandle, WorkerPoolHandle, spawn_pool,
    start_scheduler,
};
use db::{Created, EventBus, JobStore, MemoryStore, Store, StoreConfig, connect};
use queue_core::{
    JobEvent, JobId, JobOptions, JobState, JobView, QueueConfig, QueueError, Settings,
};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

/// Options for [`HotQueue::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Number of jobs processed at once by the pool.
    pub concurrent_jobs: usize,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self { concurrent_jobs: 1 }
    }
}

impl ProcessOptions {
    pub fn with_concurrent_jobs(mut self, concurrent_jobs: usize) -> Self {
        self.concurrent_jobs = concurrent_jobs;
        self
    }
}

/// A job queue bound to one store and one configuration.
pub struct HotQueue {
    jobs: JobStore,
    scheduler: Mutex<Option<SchedulerHandle>>,
    pools: Mutex<Vec<WorkerPoolHandle>>,
}

impl HotQueue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        let jobs = JobStore::new(store, Settings::new(config), EventBus::default());
        Self {
            jobs,
            scheduler: Mutex::new(None),
            pools: Mutex::new(Vec::new()),
        }
    }

    /// Queue over a fresh in-memory store.
    pub fn memory(config: QueueConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Build the queue from `HOTQUEUE_*` environment variables.
    pub async fn from_env() -> Result<Self, QueueError> {
        let store = connect(&StoreConfig::from_env()).await?;
        Ok(Self::new(store, QueueConfig::from_env()))
    }

    /// Create a job and route it.
    ///
    /// When the job asks for hotjob notification the returned
    /// [`Created::hotjob`] resolves with its outcome.
    pub async fn create(
        &self,
        name: &str,
        data: Value,
        options: &JobOptions,
    ) -> Result<Created, QueueError> {
        self.jobs.create(name, data, options).await
    }

    /// Start a pool consuming `names` with `handler`.
    ///
    /// Also starts the scheduler if it is enabled and not yet running.
    pub async fn process<I, S, F, Fut>(
        &self,
        names: I,
        options: ProcessOptions,
        handler: F,
    ) -> Result<WorkerPoolHandle, QueueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.process_with(names, options, Arc::new(handler)).await
    }

    /// Like [`HotQueue::process`], for a handler that is already shared.
    pub async fn process_with<I, S>(
        &self,
        names: I,
        options: ProcessOptions,
        handler: Arc<dyn JobHandler>,
    ) -> Result<WorkerPoolHandle, QueueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(QueueError::Spawn("process needs at least one job name".into()));
        }

        self.ensure_scheduler().await?;

        let pool = spawn_pool(names, options.concurrent_jobs, self.jobs.clone(), handler).await?;
        tracing::info!(
            "Registered {} for {:?} ({} concurrent)",
            pool.id(),
            pool.names(),
            options.concurrent_jobs
        );
        self.pools.lock().await.push(pool.clone());
        Ok(pool)
    }

    async fn ensure_scheduler(&self) -> Result<(), QueueError> {
        if !self.jobs.settings().current().scheduler.enabled {
            return Ok(());
        }
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.as_ref().is_none_or(|s| s.is_disposed()) {
            *scheduler = Some(start_scheduler(self.jobs.clone()).await?);
        }
        Ok(())
    }

    /// Public view of a job.
    pub async fn get(&self, id: JobId) -> Result<JobView, QueueError> {
        Ok(self.jobs.fetch(id).await?.view())
    }

    /// Number of jobs in each state.
    pub async fn counts(&self) -> Result<HashMap<JobState, u64>, QueueError> {
        self.jobs.count_by_state().await
    }

    /// Dispose every pool and the scheduler, restore the default
    /// configuration and release the store.
    pub async fn reset(&self) -> Result<(), QueueError> {
        let pools: Vec<WorkerPoolHandle> = self.pools.lock().await.drain(..).collect();
        for pool in &pools {
            pool.dispose().await;
        }
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.dispose().await;
        }
        self.jobs.settings().reset();
        self.jobs.store().close().await?;
        tracing::info!("Queue reset: {} pools disposed", pools.len());
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        self.jobs.settings()
    }

    /// Receiver for lifecycle events of every job in this queue.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.jobs.bus().subscribe()
    }

    /// The underlying job store.
    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }
}
