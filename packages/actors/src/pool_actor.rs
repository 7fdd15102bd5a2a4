//! Worker pool actor: owns a group of workers, their throttle and their guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use db::JobStore;
use queue_core::{JobId, QueueError, WorkerConfig};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use ulid::Ulid;

use crate::guard::{self, InFlight};
use crate::handler::JobHandler;
use crate::messages::{PoolMessage, WorkerMessage};
use crate::throttle::Throttle;
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Extra time workers get to release their jobs on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Unique identifier for a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(pub Ulid);

impl PoolId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
    pub throttled: bool,
}

/// Pool actor arguments.
pub struct PoolArgs {
    pub pool_id: PoolId,
    pub names: Vec<String>,
    pub concurrency: usize,
    pub jobs: JobStore,
    pub handler: Arc<dyn JobHandler>,
}

/// State for the pool actor.
pub struct PoolActorState {
    pool_id: PoolId,
    capacity: usize,
    jobs: JobStore,
    config: WorkerConfig,
    workers: Vec<ActorRef<WorkerMessage>>,
    in_flight: HashMap<JobId, InFlight>,
    throttle: Throttle,
    throttle_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    stopping: bool,
    processed: u64,
    failed: u64,
}

impl PoolActorState {
    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            in_flight: self.in_flight.len(),
            processed: self.processed,
            failed: self.failed,
            throttled: self.throttle.is_engaged(),
        }
    }

    fn release_throttle(&mut self) {
        self.throttle.release();
        let _ = self.throttle_tx.send(false);
    }

    /// Ask every worker to stop. Running jobs are released by their worker
    /// before it exits.
    fn stop_workers(&mut self) {
        self.stopping = true;
        let _ = self.shutdown_tx.send(true);
        for worker in &self.workers {
            let _ = worker.send_message(WorkerMessage::Shutdown);
        }
    }

    fn forget_worker(&mut self, myself: &ActorRef<PoolMessage>, id: ractor::ActorId) {
        self.workers.retain(|w| w.get_id() != id);
        if self.stopping && self.workers.is_empty() {
            myself.stop(None);
        }
    }

    async fn audit(&mut self) {
        let report = guard::audit(
            &self.in_flight,
            self.capacity,
            &self.throttle,
            self.config.guard_factor,
            Instant::now(),
        );
        if report.is_clean() {
            return;
        }

        for job_id in &report.stuck {
            if let Some(held) = self.in_flight.get(job_id) {
                tracing::warn!(
                    job_id = %job_id,
                    worker = %held.worker_id,
                    "Job outlived its timeout, forcing the timeout path"
                );
                held.force.notify_one();
            }
        }

        if let Some(count) = report.over_capacity {
            tracing::error!(
                "{} holds {} jobs with capacity {}",
                self.pool_id,
                count,
                self.capacity
            );
        }

        if report.stale_throttle {
            match self.jobs.store().ping().await {
                Ok(()) => {
                    tracing::warn!("{} throttle outlived its timeout, clearing", self.pool_id);
                    self.release_throttle();
                }
                Err(e) => tracing::warn!("{} throttle kept, store unhealthy: {}", self.pool_id, e),
            }
        }
    }
}

/// Pool actor that supervises a group of workers.
pub struct PoolActor;

impl Actor for PoolActor {
    type Msg = PoolMessage;
    type State = PoolActorState;
    type Arguments = PoolArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let config = args.jobs.settings().current().worker;
        tracing::info!(
            "Starting {} on {:?} with {} workers",
            args.pool_id,
            args.names,
            args.concurrency
        );

        let (throttle_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);

        let mut workers = Vec::with_capacity(args.concurrency);
        for index in 0..args.concurrency {
            let worker_id = format!("{}-worker-{}", args.pool_id, index + 1);
            let worker_args = WorkerArgs {
                worker_id: worker_id.clone(),
                names: args.names.clone(),
                jobs: args.jobs.clone(),
                store: args.jobs.store().dedicated().await?,
                handler: args.handler.clone(),
                pool: myself.clone(),
                config: config.clone(),
                throttled: throttle_tx.subscribe(),
                shutdown: shutdown_tx.subscribe(),
            };
            let (worker, _handle) =
                Actor::spawn_linked(Some(worker_id), WorkerActor, worker_args, myself.get_cell())
                    .await
                    .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;
            workers.push(worker);
        }

        // Guard audit timer
        let myself_clone = myself.clone();
        let guard_interval = Duration::from_millis(config.guard_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(guard_interval).await;
                if myself_clone.send_message(PoolMessage::Audit).is_err() {
                    break;
                }
            }
        });

        Ok(PoolActorState {
            pool_id: args.pool_id,
            capacity: args.concurrency,
            jobs: args.jobs,
            throttle: Throttle::new(&config),
            config,
            workers,
            in_flight: HashMap::new(),
            throttle_tx,
            shutdown_tx,
            stopping: false,
            processed: 0,
            failed: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::JobStarted {
                job_id,
                worker_id,
                timeout,
                force,
            } => {
                state.in_flight.insert(
                    job_id,
                    InFlight {
                        worker_id,
                        started: Instant::now(),
                        timeout,
                        force,
                    },
                );
                if state.in_flight.len() > state.capacity {
                    tracing::error!(
                        "{} capacity exceeded: {} in flight, capacity {}",
                        state.pool_id,
                        state.in_flight.len(),
                        state.capacity
                    );
                }
            }

            PoolMessage::JobFinished { job_id, success } => {
                state.in_flight.remove(&job_id);
                state.processed += 1;
                if !success {
                    state.failed += 1;
                }
            }

            PoolMessage::PopFailed { worker_id, error } => {
                tracing::debug!("{} pop failed on {}: {}", state.pool_id, worker_id, error);
                if state.throttle.record_failure(Instant::now()) {
                    let timeout = state.throttle.timeout();
                    let generation = state.throttle.generation();
                    tracing::warn!(
                        "{} throttled for {}ms after repeated dequeue failures",
                        state.pool_id,
                        timeout.as_millis()
                    );
                    let _ = state.throttle_tx.send(true);

                    let myself_clone = myself.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = myself_clone.send_message(PoolMessage::ThrottleExpired { generation });
                    });
                }
            }

            PoolMessage::ThrottleExpired { generation } => {
                if state.throttle.is_engaged() && state.throttle.generation() == generation {
                    tracing::info!("{} throttle released", state.pool_id);
                    state.release_throttle();
                }
            }

            PoolMessage::Audit => state.audit().await,

            PoolMessage::GetStats { reply } => {
                let _ = reply.send(state.stats());
            }

            PoolMessage::Shutdown => {
                if state.stopping {
                    return Ok(());
                }
                tracing::info!("Shutting down {}", state.pool_id);
                state.stop_workers();
                if state.workers.is_empty() {
                    myself.stop(None);
                    return Ok(());
                }

                // Workers normally exit once their current job is reported.
                let deadline = Duration::from_millis(state.config.fetch_timeout_ms)
                    .saturating_add(SHUTDOWN_GRACE);
                let myself_clone = myself.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    myself_clone.stop(Some("workers did not stop in time".into()));
                });
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.stop_workers();
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!(
                    "Worker {} terminated: {:?}",
                    cell.get_name().unwrap_or_default(),
                    reason
                );
                state.forget_worker(&myself, cell.get_id());
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                tracing::error!(
                    "Worker {} failed: {}",
                    cell.get_name().unwrap_or_default(),
                    error
                );
                state.forget_worker(&myself, cell.get_id());
            }
            _ => {}
        }
        Ok(())
    }
}

struct HandleInner {
    pool_id: PoolId,
    names: Vec<String>,
    actor: ActorRef<PoolMessage>,
    join: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Handle to a running worker pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct WorkerPoolHandle {
    inner: Arc<HandleInner>,
}

impl WorkerPoolHandle {
    pub fn id(&self) -> PoolId {
        self.inner.pool_id
    }

    /// Job names this pool consumes.
    pub fn names(&self) -> &[String] {
        &self.inner.names
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Current counters of the pool.
    pub async fn stats(&self) -> Result<PoolStats, QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        let timeout = Duration::from_secs(5);
        let result = ractor::rpc::call(
            &self.inner.actor,
            |reply| PoolMessage::GetStats { reply },
            Some(timeout),
        )
        .await
        .map_err(|_| QueueError::Disposed)?;
        match result {
            ractor::rpc::CallResult::Success(stats) => Ok(stats),
            ractor::rpc::CallResult::Timeout => Err(QueueError::Timeout("pool stats".into())),
            ractor::rpc::CallResult::SenderError => Err(QueueError::Disposed),
        }
    }

    /// Stop every worker and the pool. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.actor.send_message(PoolMessage::Shutdown);
        if let Some(join) = self.inner.join.lock().await.take()
            && let Err(e) = join.await
        {
            tracing::warn!("{} did not stop cleanly: {}", self.inner.pool_id, e);
        }
    }
}

/// Spawn a pool of `concurrency` workers consuming `names`.
pub async fn spawn_pool(
    names: Vec<String>,
    concurrency: usize,
    jobs: JobStore,
    handler: Arc<dyn JobHandler>,
) -> Result<WorkerPoolHandle, QueueError> {
    let pool_id = PoolId::new();
    let args = PoolArgs {
        pool_id,
        names: names.clone(),
        concurrency: concurrency.max(1),
        jobs,
        handler,
    };
    let (actor, join) = Actor::spawn(Some(pool_id.to_string()), PoolActor, args)
        .await
        .map_err(|e| QueueError::Spawn(e.to_string()))?;

    Ok(WorkerPoolHandle {
        inner: Arc::new(HandleInner {
            pool_id,
            names,
            actor,
            join: Mutex::new(Some(join)),
            disposed: AtomicBool::new(false),
        }),
    })
}
