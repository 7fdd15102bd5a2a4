//! Scheduler actor: re-activates delayed, retrying and ghosted jobs and purges
//! finished ones once their time comes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use db::{JobStore, Op};
use queue_core::{JobId, QueueError, ScheduleSet, SchedulerConfig};
use rand::Rng;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::messages::SchedulerMessage;

/// Delay before a claimed job's timer fires.
///
/// `due_ms` is the job's due time. A missing or already passed due time, or
/// one further than twice the look-ahead window, falls back to the window
/// itself.
pub fn arm_delay(due_ms: Option<i64>, now_ms: i64, look_ahead: Duration) -> Duration {
    let Some(due_ms) = due_ms else {
        return look_ahead;
    };
    let window = i64::try_from(look_ahead.as_millis()).unwrap_or(i64::MAX);
    let diff = due_ms.saturating_sub(now_ms);
    if diff < 0 || diff > window.saturating_mul(2) {
        return look_ahead;
    }
    Duration::from_millis(u64::try_from(diff).unwrap_or(0))
}

/// Interval until the next ping: `interval + random(0, fuzz)`.
fn next_ping_delay(config: &SchedulerConfig) -> Duration {
    let jitter = if config.fuzz_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.fuzz_ms)
    };
    Duration::from_millis(config.interval_ms.saturating_add(jitter))
}

/// A claimed job waiting for its timer.
struct Pending {
    score: i64,
    timer: JoinHandle<()>,
}

/// State for the scheduler actor.
pub struct SchedulerState {
    jobs: JobStore,
    config: SchedulerConfig,
    pending: HashMap<(ScheduleSet, JobId), Pending>,
    next_ping: Option<JoinHandle<()>>,
    watcher: JoinHandle<()>,
}

impl SchedulerState {
    fn arm_ping(&mut self, myself: &ActorRef<SchedulerMessage>, delay: Duration) {
        if let Some(previous) = self.next_ping.take() {
            previous.abort();
        }
        let myself = myself.clone();
        self.next_ping = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = myself.send_message(SchedulerMessage::Ping);
        }));
    }

    /// Claim everything due within the look-ahead window, overdue members
    /// included, and arm a timer per job.
    async fn claim(
        &mut self,
        myself: &ActorRef<SchedulerMessage>,
        set: ScheduleSet,
    ) -> Result<usize, QueueError> {
        let key = self.jobs.keys().schedule_set(set);
        let now_ms = Utc::now().timestamp_millis();
        let look_ahead = Duration::from_millis(self.config.look_ahead_ms);
        let window = i64::try_from(self.config.look_ahead_ms).unwrap_or(i64::MAX);

        let claimed = self
            .jobs
            .store()
            .zclaim(&key, i64::MIN, now_ms.saturating_add(window))
            .await?;
        let count = claimed.len();

        for (member, score) in claimed {
            let Ok(job_id) = JobId::parse(&member) else {
                tracing::warn!("Dropping malformed id '{}' from {}", member, key);
                continue;
            };

            let due_ms = match set {
                ScheduleSet::Scheduled => match self.jobs.fetch(job_id).await {
                    Ok(job) => job.scheduled_for.map(|at| at.timestamp_millis()),
                    Err(QueueError::NoRecord(_)) => {
                        tracing::debug!(job_id = %job_id, "Scheduled job no longer exists");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, "Failed to load scheduled job: {}", e);
                        None
                    }
                },
                ScheduleSet::ScheduledPurge => Some(score),
            };

            let delay = arm_delay(due_ms, now_ms, look_ahead);
            tracing::debug!(job_id = %job_id, set = %set, "Timer armed for {}ms", delay.as_millis());

            let myself = myself.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = myself.send_message(SchedulerMessage::Due { set, job_id });
            });
            if let Some(replaced) = self.pending.insert((set, job_id), Pending { score, timer }) {
                replaced.timer.abort();
            }
        }

        Ok(count)
    }

    async fn fire(&mut self, set: ScheduleSet, job_id: JobId) {
        if self.pending.remove(&(set, job_id)).is_none() {
            return;
        }
        match set {
            ScheduleSet::Scheduled => match self.jobs.activate(job_id).await {
                Ok(_) => tracing::debug!(job_id = %job_id, "Job re-queued"),
                Err(QueueError::NoRecord(_)) | Err(QueueError::InvalidState { .. }) => {
                    tracing::debug!(job_id = %job_id, "Skipping activation of a settled job");
                }
                Err(e) => tracing::warn!(job_id = %job_id, "Failed to re-queue job: {}", e),
            },
            ScheduleSet::ScheduledPurge => match self.jobs.purge(job_id).await {
                Ok(_) => {}
                Err(e) => tracing::warn!(job_id = %job_id, "Failed to purge job: {}", e),
            },
        }
    }

    /// Stop every timer and put still-pending claims back in their sets.
    async fn release(&mut self) {
        if let Some(next_ping) = self.next_ping.take() {
            next_ping.abort();
        }
        self.watcher.abort();

        if self.pending.is_empty() {
            return;
        }
        let keys = self.jobs.keys().clone();
        let ops: Vec<Op> = self
            .pending
            .drain()
            .map(|((set, job_id), pending)| {
                pending.timer.abort();
                Op::ZAdd {
                    key: keys.schedule_set(set),
                    member: job_id.to_string(),
                    score: pending.score,
                }
            })
            .collect();
        let count = ops.len();
        if let Err(e) = self.jobs.store().exec(ops).await {
            tracing::warn!("Failed to return {} claimed jobs to their sets: {}", count, e);
        }
    }
}

/// Scheduler actor. One per queue.
pub struct SchedulerActor;

impl Actor for SchedulerActor {
    type Msg = SchedulerMessage;
    type State = SchedulerState;
    type Arguments = JobStore;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        jobs: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let config = jobs.settings().current().scheduler;
        tracing::info!(
            "Scheduler starting: interval {}ms, fuzz {}ms, look-ahead {}ms",
            config.interval_ms,
            config.fuzz_ms,
            config.look_ahead_ms
        );

        // Cadence watcher
        let mut rx = jobs.settings().subscribe();
        let myself_clone = myself.clone();
        let watcher = tokio::spawn(async move {
            let mut last = rx.borrow_and_update().scheduler.clone();
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().scheduler.clone();
                if current != last {
                    last = current;
                    if myself_clone.send_message(SchedulerMessage::Reconfigure).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(SchedulerState {
            jobs,
            config,
            pending: HashMap::new(),
            next_ping: None,
            watcher,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        myself.send_message(SchedulerMessage::Ping)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMessage::Ping => {
                for set in ScheduleSet::ALL {
                    match state.claim(&myself, set).await {
                        Ok(0) => {}
                        Ok(count) => tracing::debug!("Claimed {} jobs from {}", count, set),
                        Err(e) => tracing::warn!("Scheduler cycle failed for {}: {}", set, e),
                    }
                }
                if state.config.enabled {
                    let delay = next_ping_delay(&state.config);
                    state.arm_ping(&myself, delay);
                }
            }

            SchedulerMessage::Reconfigure => {
                state.config = state.jobs.settings().current().scheduler;
                tracing::info!(
                    "Scheduler cadence changed: interval {}ms, fuzz {}ms, look-ahead {}ms",
                    state.config.interval_ms,
                    state.config.fuzz_ms,
                    state.config.look_ahead_ms
                );
                if state.config.enabled {
                    let delay = Duration::from_millis(state.config.restart_delay_ms);
                    state.arm_ping(&myself, delay);
                } else if let Some(next_ping) = state.next_ping.take() {
                    next_ping.abort();
                }
            }

            SchedulerMessage::Due { set, job_id } => state.fire(set, job_id).await,

            SchedulerMessage::Shutdown => {
                tracing::info!("Shutting down scheduler");
                state.release().await;
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
        state.release().await;
        tracing::info!("Scheduler stopped");
        Ok(())
    }
}

struct HandleInner {
    actor: ActorRef<SchedulerMessage>,
    join: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Handle to a running scheduler. Clones refer to the same scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl SchedulerHandle {
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Claim due jobs now instead of waiting for the next tick.
    pub fn ping(&self) -> Result<(), QueueError> {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }
        self.inner
            .actor
            .send_message(SchedulerMessage::Ping)
            .map_err(|_| QueueError::Disposed)
    }

    /// Stop the scheduler. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.actor.send_message(SchedulerMessage::Shutdown);
        if let Some(join) = self.inner.join.lock().await.take()
            && let Err(e) = join.await
        {
            tracing::warn!("Scheduler did not stop cleanly: {}", e);
        }
    }
}

/// Spawn the scheduler for the queue behind `jobs`.
pub async fn start_scheduler(jobs: JobStore) -> Result<SchedulerHandle, QueueError> {
    let name = format!("{}:scheduler-{}", jobs.keys().namespace(), Ulid::new());
    let (actor, join) = Actor::spawn(Some(name), SchedulerActor, jobs)
        .await
        .map_err(|e| QueueError::Spawn(e.to_string()))?;

    Ok(SchedulerHandle {
        inner: Arc::new(HandleInner {
            actor,
            join: Mutex::new(Some(join)),
            disposed: AtomicBool::new(false),
        }),
    })
}
