//! Worker actor: one sequential consumption loop of a pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{JobStore, Store};
use queue_core::{JobId, JobState, Outcome, QueueError, WorkerConfig};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::handler::{JobContext, JobHandler};
use crate::messages::{PoolMessage, WorkerMessage};

/// Failure message recorded when a handler panics.
pub const PANIC_MESSAGE: &str = "handler panicked";

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Init,
    PopWait,
    PreWorker,
    WorkerRun,
    PostWorker,
    PostWorkerError,
    PopError,
    Disposed,
}

/// What to do after an iteration.
enum Step {
    Next,
    RetryAfter(Duration),
    Stop,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub names: Vec<String>,
    pub jobs: JobStore,
    /// Connection reserved for this worker's blocking pops.
    pub store: Arc<dyn Store>,
    pub handler: Arc<dyn JobHandler>,
    pub pool: ActorRef<PoolMessage>,
    pub config: WorkerConfig,
    pub throttled: watch::Receiver<bool>,
    pub shutdown: watch::Receiver<bool>,
}

/// State for the worker actor.
pub struct WorkerActorState {
    worker_id: String,
    queues: Vec<String>,
    jobs: JobStore,
    store: Arc<dyn Store>,
    handler: Arc<dyn JobHandler>,
    pool: ActorRef<PoolMessage>,
    config: WorkerConfig,
    throttled: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    phase: WorkerPhase,
}

impl WorkerActorState {
    fn new(args: WorkerArgs) -> Self {
        let queues = args.names.iter().map(|name| args.jobs.keys().queue(name)).collect();
        Self {
            worker_id: args.worker_id,
            queues,
            jobs: args.jobs,
            store: args.store,
            handler: args.handler,
            pool: args.pool,
            config: args.config,
            throttled: args.throttled,
            shutdown: args.shutdown,
            phase: WorkerPhase::Init,
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn report_pop_failure(&mut self, error: &QueueError) -> Step {
        self.phase = WorkerPhase::PopError;
        tracing::warn!(worker = %self.worker_id, "Dequeue failed: {}", error);
        let _ = self.pool.send_message(PoolMessage::PopFailed {
            worker_id: self.worker_id.clone(),
            error: error.to_string(),
        });
        Step::RetryAfter(Duration::from_millis(self.config.pop_error_delay_ms))
    }

    /// Pop one job id, run the handler on it and report the outcome.
    async fn iterate(&mut self) -> Step {
        if self.is_shutdown() {
            return Step::Stop;
        }

        while *self.throttled.borrow() {
            tokio::select! {
                changed = self.throttled.changed() => {
                    if changed.is_err() {
                        return Step::Stop;
                    }
                }
                _ = self.shutdown.changed() => return Step::Stop,
            }
        }

        self.phase = WorkerPhase::PopWait;
        let fetch_timeout = Duration::from_millis(self.config.fetch_timeout_ms);
        let popped = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return Step::Stop,
            popped = self.store.blpop(&self.queues, fetch_timeout) => popped,
        };
        let raw = match popped {
            Ok(Some((_, raw))) => raw,
            Ok(None) => return Step::Next,
            Err(e) => return self.report_pop_failure(&QueueError::from(e)),
        };
        let Ok(job_id) = JobId::parse(&raw) else {
            tracing::warn!(worker = %self.worker_id, "Discarding malformed job id {:?}", raw);
            return Step::Next;
        };

        self.phase = WorkerPhase::PreWorker;
        let mut job = match self.jobs.fetch(job_id).await {
            Ok(job) => job,
            Err(e @ QueueError::Database(_)) => return self.report_pop_failure(&e),
            Err(e) => {
                tracing::warn!(job_id = %job_id, worker = %self.worker_id, "Popped job lost: {}", e);
                return Step::Next;
            }
        };
        if job.state.is_complete() {
            tracing::warn!(job_id = %job_id, state = %job.state, "Skipping finished job");
            return Step::Next;
        }

        let previous = job.state;
        job.begin_run(&self.worker_id, Utc::now());
        job.state = JobState::Processing;
        if let Err(e) = self.jobs.save(&job, previous).await {
            return self.report_pop_failure(&e);
        }

        self.phase = WorkerPhase::WorkerRun;
        let timeout = Duration::from_millis(job.policy.process_timeout);
        let force = Arc::new(Notify::new());
        let _ = self.pool.send_message(PoolMessage::JobStarted {
            job_id,
            worker_id: self.worker_id.clone(),
            timeout,
            force: force.clone(),
        });
        tracing::debug!(job_id = %job_id, worker = %self.worker_id, attempt = job.runs.len(), "Job started");

        let ctx = JobContext {
            job: job.view(),
            worker_id: self.worker_id.clone(),
        };
        let started = Instant::now();
        let outcome = execute(self.handler.as_ref(), ctx, timeout, &force, &mut self.shutdown).await;
        let stopping = outcome.is_none();
        // A run cut short by shutdown counts as a timeout.
        let outcome = outcome.unwrap_or(Outcome::TimedOut);
        if stopping {
            tracing::info!(job_id = %job_id, worker = %self.worker_id, "Shutdown interrupted job, releasing it");
        }

        job.finish_run(&outcome, started.elapsed(), Utc::now());
        let reported = self
            .jobs
            .processed(&mut job, outcome.is_success(), outcome.is_timeout())
            .await;
        let _ = self.pool.send_message(PoolMessage::JobFinished {
            job_id,
            success: outcome.is_success(),
        });

        match reported {
            Ok(next) => {
                self.phase = WorkerPhase::PostWorker;
                tracing::debug!(job_id = %job_id, worker = %self.worker_id, state = %next, "Job reported");
            }
            Err(e) => {
                self.phase = WorkerPhase::PostWorkerError;
                tracing::error!(job_id = %job_id, worker = %self.worker_id, "Failed to report job: {}", e);
            }
        }
        if stopping { Step::Stop } else { Step::Next }
    }
}

/// Run the handler until it returns, its timeout fires, or the guard forces a timeout.
///
/// Returns `None` when shutdown wins.
async fn execute(
    handler: &dyn JobHandler,
    ctx: JobContext,
    timeout: Duration,
    force: &Notify,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Outcome> {
    let mut task = tokio::spawn(handler.handle(ctx));
    let outcome = tokio::select! {
        biased;
        joined = &mut task => match joined {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(message)) => Outcome::Failed(message),
            Err(e) if e.is_panic() => Outcome::Failed(PANIC_MESSAGE.to_string()),
            Err(e) => Outcome::Failed(e.to_string()),
        },
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        _ = force.notified() => Outcome::TimedOut,
        _ = shutdown.changed() => {
            task.abort();
            return None;
        }
    };
    task.abort();
    Some(outcome)
}

/// Worker actor that executes jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);
        Ok(WorkerActorState::new(args))
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        myself.send_message(WorkerMessage::Pop)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Pop => {
                if state.phase == WorkerPhase::Disposed {
                    return Ok(());
                }
                match state.iterate().await {
                    Step::Next => myself.send_message(WorkerMessage::Pop)?,
                    Step::RetryAfter(delay) => {
                        let myself_clone = myself.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = myself_clone.send_message(WorkerMessage::Pop);
                        });
                    }
                    Step::Stop => {
                        state.phase = WorkerPhase::Disposed;
                        myself.stop(None);
                    }
                }
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                state.phase = WorkerPhase::Disposed;
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.phase = WorkerPhase::Disposed;
        if let Err(e) = state.store.close().await {
            tracing::debug!("Closing worker connection failed: {}", e);
        }
        tracing::debug!("Worker {} stopped", state.worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResult;
    use queue_core::{Job, JobPolicy};

    fn ctx() -> JobContext {
        JobContext {
            job: Job::new(JobId(1), "t", serde_json::Value::Null, JobPolicy::default()).view(),
            worker_id: "w-1".into(),
        }
    }

    fn handler_fn<F, Fut>(f: F) -> F
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        f
    }

    async fn run(handler: impl JobHandler, timeout_ms: u64) -> Option<Outcome> {
        let (_tx, mut rx) = watch::channel(false);
        let force = Notify::new();
        execute(&handler, ctx(), Duration::from_millis(timeout_ms), &force, &mut rx).await
    }

    #[tokio::test]
    async fn classifies_handler_results() {
        let ok = run(handler_fn(|_ctx| async { Ok(()) }), 1_000).await;
        assert_eq!(ok, Some(Outcome::Success));

        let failed = run(handler_fn(|_ctx| async { Err("nope".to_string()) }), 1_000).await;
        assert_eq!(failed, Some(Outcome::Failed("nope".into())));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let outcome = run(
            handler_fn(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
            20,
        )
        .await;
        assert_eq!(outcome, Some(Outcome::TimedOut));
    }

    #[tokio::test]
    async fn panic_is_a_failure() {
        let outcome = run(
            handler_fn(|ctx| async move {
                if ctx.attempt() == 1 {
                    panic!("boom");
                }
                Ok(())
            }),
            1_000,
        )
        .await;
        assert_eq!(outcome, Some(Outcome::Failed(PANIC_MESSAGE.into())));
    }

    #[tokio::test]
    async fn force_wins_over_long_timeout() {
        let (_tx, mut rx) = watch::channel(false);
        let force = Notify::new();
        force.notify_one();
        let handler = handler_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        let outcome = execute(&handler, ctx(), Duration::from_secs(60), &force, &mut rx).await;
        assert_eq!(outcome, Some(Outcome::TimedOut));
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_handler() {
        let (tx, mut rx) = watch::channel(false);
        let force = Notify::new();
        let handler = handler_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        let stop = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        };
        let (outcome, _) = tokio::join!(
            execute(&handler, ctx(), Duration::from_secs(60), &force, &mut rx),
            stop
        );
        assert_eq!(outcome, None);
    }
}
