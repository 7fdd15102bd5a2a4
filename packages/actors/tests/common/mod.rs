#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use actors::{HandlerResult, JobContext, JobHandler};
use queue_core::{Job, JobId, QueueConfig, QueueError, SchedulerConfig, Settings, WorkerConfig};

use db::{
    EventBus, JobStore, MemoryStore, Op, Store, StoreError, StoreFuture, Subscription,
};

/// Configuration with cadences short enough for tests.
pub fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_scheduler(SchedulerConfig {
            interval_ms: 20,
            fuzz_ms: 5,
            ..SchedulerConfig::default()
        })
        .with_worker(WorkerConfig {
            fetch_timeout_ms: 50,
            pop_error_delay_ms: 10,
            guard_interval_ms: 50,
            ..WorkerConfig::default()
        })
}

/// Job store over a fresh in-memory store.
pub fn job_store(config: QueueConfig) -> JobStore {
    job_store_on(Arc::new(MemoryStore::new()), config)
}

pub fn job_store_on(store: Arc<dyn Store>, config: QueueConfig) -> JobStore {
    JobStore::new(store, Settings::new(config), EventBus::default())
}

/// Box a closure as a shared handler.
pub fn handler<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(f)
}

/// Poll `id` until `done` holds or `within` elapses.
pub async fn wait_for(
    jobs: &JobStore,
    id: JobId,
    within: Duration,
    done: impl Fn(&Job) -> bool,
) -> Result<Job, QueueError> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let job = jobs.fetch(id).await?;
        if done(&job) {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(QueueError::Timeout(format!(
                "job {} still {} after {:?}",
                id, job.state, within
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Store whose blocking pops fail while `failing` is set.
#[derive(Clone)]
pub struct FlakyStore {
    inner: Arc<dyn Store>,
    failing: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Store for FlakyStore {
    fn incr<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        self.inner.incr(key)
    }

    fn hget<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>> {
        self.inner.hget(key, field)
    }

    fn exec(&self, ops: Vec<Op>) -> StoreFuture<'_, ()> {
        self.inner.exec(ops)
    }

    fn blpop<'a>(
        &'a self,
        keys: &'a [String],
        timeout: Duration,
    ) -> StoreFuture<'a, Option<(String, String)>> {
        if self.failing.load(Ordering::SeqCst) {
            return Box::pin(async { Err(StoreError::Connection("injected failure".into())) });
        }
        self.inner.blpop(keys, timeout)
    }

    fn zclaim<'a>(&'a self, key: &'a str, min: i64, max: i64) -> StoreFuture<'a, Vec<(String, i64)>> {
        self.inner.zclaim(key, min, max)
    }

    fn zcard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        self.inner.zcard(key)
    }

    fn scard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        self.inner.scard(key)
    }

    fn sismember<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        self.inner.sismember(key, member)
    }

    fn llen<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        self.inner.llen(key)
    }

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> StoreFuture<'a, ()> {
        self.inner.publish(channel, payload)
    }

    fn subscribe(&self, channels: Vec<String>) -> StoreFuture<'_, Subscription> {
        self.inner.subscribe(channels)
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        self.inner.ping()
    }

    fn dedicated(&self) -> StoreFuture<'_, Arc<dyn Store>> {
        Box::pin(async move { Ok(Arc::new(self.clone()) as Arc<dyn Store>) })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
