//! Process-wide configuration and its change notifications.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::JobPolicy;

/// Polling cadence of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Start a scheduler alongside the queue.
    pub enabled: bool,
    /// Base delay between pings (milliseconds).
    pub interval_ms: u64,
    /// Upper bound of the random jitter added to each interval (milliseconds).
    pub fuzz_ms: u64,
    /// Half-width of the window around now in which due jobs are claimed (milliseconds).
    pub look_ahead_ms: u64,
    /// Delay before the next ping after a cadence change (milliseconds).
    pub restart_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
            fuzz_ms: 300,
            look_ahead_ms: 2_000,
            restart_delay_ms: 10,
        }
    }
}

/// Worker pool tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long a blocking pop waits for a job id (milliseconds).
    pub fetch_timeout_ms: u64,
    /// Pause after a failed pop before trying again (milliseconds).
    pub pop_error_delay_ms: u64,
    /// Pop failures tolerated inside the window before throttling.
    pub throttle_failures: usize,
    pub throttle_window_ms: u64,
    /// How long dequeues stay suspended once throttled (milliseconds).
    pub throttle_timeout_ms: u64,
    /// Period of the guard audit (milliseconds).
    pub guard_interval_ms: u64,
    /// Multiple of a timeout after which the guard intervenes.
    pub guard_factor: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 2_000,
            pop_error_delay_ms: 1_000,
            throttle_failures: 5,
            throttle_window_ms: 10_000,
            throttle_timeout_ms: 30_000,
            guard_interval_ms: 30_000,
            guard_factor: 1.5,
        }
    }
}

/// Configuration for queue behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Key prefix for everything stored by this queue.
    pub namespace: String,
    /// Delete finished jobs once their purge time arrives.
    pub purge: bool,
    /// Time a finished job is kept before purging (milliseconds).
    pub purge_timeout_ms: u64,
    /// Policy applied to jobs that do not override it.
    pub job: JobPolicy,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "hq".to_string(),
            purge: true,
            purge_timeout_ms: 7 * 24 * 60 * 60 * 1_000,
            job: JobPolicy::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Read overrides from `HOTQUEUE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(namespace) = std::env::var("HOTQUEUE_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(purge) = env_parse("HOTQUEUE_PURGE") {
            config.purge = purge;
        }
        if let Some(timeout) = env_parse("HOTQUEUE_PURGE_TIMEOUT_MS") {
            config.purge_timeout_ms = timeout;
        }
        if let Some(interval) = env_parse("HOTQUEUE_SCHEDULER_INTERVAL_MS") {
            config.scheduler.interval_ms = interval;
        }
        if let Some(fuzz) = env_parse("HOTQUEUE_SCHEDULER_FUZZ_MS") {
            config.scheduler.fuzz_ms = fuzz;
        }
        config
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the default job policy.
    pub fn with_job_policy(mut self, job: JobPolicy) -> Self {
        self.job = job;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Enable or disable purging, keeping finished jobs for `timeout_ms`.
    pub fn with_purge(mut self, enabled: bool, timeout_ms: u64) -> Self {
        self.purge = enabled;
        self.purge_timeout_ms = timeout_ms;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Shared, observable handle to the live configuration.
///
/// Components read the current value when they need it; the few that cache
/// derived values subscribe and refresh on change.
#[derive(Debug, Clone)]
pub struct Settings {
    tx: Arc<watch::Sender<QueueConfig>>,
}

impl Settings {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> QueueConfig {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<QueueConfig> {
        self.tx.subscribe()
    }

    /// Modify the configuration in place and notify observers.
    pub fn update(&self, modify: impl FnOnce(&mut QueueConfig)) {
        self.tx.send_modify(modify);
    }

    /// Restore the defaults.
    pub fn reset(&self) {
        self.tx.send_replace(QueueConfig::default());
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
