//! Routing of jobs into process lists and time-ordered sets.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_core::{Job, JobEvent, JobState, Keys, QueueError, ScheduleSet, Settings};

use crate::bus::EventBus;
use crate::hotjob::{HotjobHandle, HotjobNotifier};
use crate::repositories::record_op;
use crate::store::{Op, Store};

/// Used when a configured delay is negative or not a number.
pub const DEFAULT_SCHEDULE_DELAY: Duration = Duration::from_secs(5 * 60);

/// Convert a delay in seconds, falling back to [`DEFAULT_SCHEDULE_DELAY`].
pub fn schedule_delay(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(DEFAULT_SCHEDULE_DELAY)
}

/// Wall-clock time `delay` from now, saturating far in the future.
pub(crate) fn due_after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Places a job where its current state says it belongs.
#[derive(Clone)]
pub struct QueueRouter {
    store: Arc<dyn Store>,
    keys: Keys,
    settings: Settings,
    bus: EventBus,
}

impl QueueRouter {
    pub fn new(store: Arc<dyn Store>, keys: Keys, settings: Settings, bus: EventBus) -> Self {
        Self {
            store,
            keys,
            settings,
            bus,
        }
    }

    /// Route `job` according to its state.
    ///
    /// Returns a hotjob handle when a new job asked for one.
    pub async fn route(&self, job: &mut Job) -> Result<Option<HotjobHandle>, QueueError> {
        tracing::debug!(job_id = %job.id, name = %job.name, state = %job.state, "Routing job");

        match job.state {
            JobState::New => {
                let hotjob = HotjobNotifier::arm(&self.store, &self.keys, job).await?;
                self.push(job).await?;
                self.publish(&self.keys.create_channel(), job).await?;
                self.publish(&self.keys.queued_channel(), job).await?;
                self.bus.emit(JobEvent::Created {
                    job: Box::new(job.view()),
                    timestamp: Utc::now(),
                });
                self.emit_queued(job);
                Ok(hotjob)
            }
            JobState::Queued => {
                self.push(job).await?;
                self.publish(&self.keys.queued_channel(), job).await?;
                self.emit_queued(job);
                Ok(None)
            }
            JobState::Processing => Ok(None),
            JobState::Delayed => {
                let delay = schedule_delay(job.policy.delay.unwrap_or(0.0));
                self.schedule(job, delay).await?;
                Ok(None)
            }
            JobState::Retry => {
                self.publish_failure(job, true).await?;
                self.schedule(job, schedule_delay(job.policy.retry_interval)).await?;
                Ok(None)
            }
            JobState::Ghost => {
                self.publish_failure(job, true).await?;
                self.schedule(job, schedule_delay(job.policy.ghost_interval)).await?;
                Ok(None)
            }
            JobState::Success => {
                self.publish(&self.keys.success_channel(&job.name), job).await?;
                self.bus.emit(JobEvent::Completed {
                    job: Box::new(job.view()),
                    timestamp: Utc::now(),
                });
                self.schedule_purge(job).await?;
                Ok(None)
            }
            JobState::Fail => {
                self.publish_failure(job, false).await?;
                self.schedule_purge(job).await?;
                Ok(None)
            }
        }
    }

    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        self.store
            .exec(vec![Op::RPush {
                key: self.keys.queue(&job.name),
                value: job.id.to_string(),
            }])
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job.view())?;
        self.store.publish(channel, payload).await?;
        Ok(())
    }

    async fn publish_failure(&self, job: &Job, will_retry: bool) -> Result<(), QueueError> {
        self.publish(&self.keys.fail_channel(&job.name), job).await?;
        self.bus.emit(JobEvent::Failed {
            job: Box::new(job.view()),
            will_retry,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn emit_queued(&self, job: &Job) {
        self.bus.emit(JobEvent::Queued {
            job: Box::new(job.view()),
            timestamp: Utc::now(),
        });
    }

    /// Park a delayed, retrying or ghosted job until `delay` has passed.
    async fn schedule(&self, job: &mut Job, delay: Duration) -> Result<(), QueueError> {
        let due = due_after(delay);
        job.scheduled_for = Some(due);
        tracing::debug!(job_id = %job.id, due = %due, "Job scheduled");
        self.store
            .exec(vec![
                record_op(&self.keys, job)?,
                Op::ZAdd {
                    key: self.keys.schedule_set(ScheduleSet::Scheduled),
                    member: job.id.to_string(),
                    score: due.timestamp_millis(),
                },
            ])
            .await?;
        Ok(())
    }

    async fn schedule_purge(&self, job: &Job) -> Result<(), QueueError> {
        let due = due_after(Duration::from_millis(self.settings.current().purge_timeout_ms));
        self.store
            .exec(vec![Op::ZAdd {
                key: self.keys.schedule_set(ScheduleSet::ScheduledPurge),
                member: job.id.to_string(),
                score: due.timestamp_millis(),
            }])
            .await?;
        Ok(())
    }
}
