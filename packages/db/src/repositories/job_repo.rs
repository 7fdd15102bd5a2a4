//! Job persistence: create, fetch and state transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use queue_core::{
    Job, JobEvent, JobId, JobOptions, JobState, JobView, Keys, QueueError, ScheduleSet, Settings,
};
use serde_json::Value;

use crate::bus::EventBus;
use crate::hotjob::HotjobHandle;
use crate::repositories::{QueueRouter, record_op};
use crate::store::{Op, Store};

/// Result of creating a job.
#[derive(Debug)]
pub struct Created {
    pub job: JobView,
    /// Present when the job was created with `hotjob` set.
    pub hotjob: Option<HotjobHandle>,
}

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn Store>,
    keys: Keys,
    settings: Settings,
    router: QueueRouter,
    bus: EventBus,
}

impl JobStore {
    pub fn new(store: Arc<dyn Store>, settings: Settings, bus: EventBus) -> Self {
        let keys = Keys::new(settings.current().namespace);
        let router = QueueRouter::new(store.clone(), keys.clone(), settings.clone(), bus.clone());
        Self {
            store,
            keys,
            settings,
            router,
            bus,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> &QueueRouter {
        &self.router
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Create a job on the process queue `name` and route it.
    pub async fn create(
        &self,
        name: &str,
        data: Value,
        options: &JobOptions,
    ) -> Result<Created, QueueError> {
        let policy = options.resolve(&self.settings.current().job);
        let id = self.store.incr(&self.keys.counter()).await?;
        let mut job = Job::new(JobId(id as u64), name, data, policy);

        self.store
            .exec(vec![
                record_op(&self.keys, &job)?,
                Op::SAdd {
                    key: self.keys.state(job.state),
                    member: job.id.to_string(),
                },
                Op::ZAdd {
                    key: self.keys.time_index(),
                    member: job.id.to_string(),
                    score: job.create_time.timestamp_millis(),
                },
            ])
            .await?;
        tracing::debug!(job_id = %job.id, name, state = %job.state, "Job created");

        let hotjob = self.router.route(&mut job).await?;
        Ok(Created {
            job: job.view(),
            hotjob,
        })
    }

    /// Load a job by id.
    pub async fn fetch(&self, id: JobId) -> Result<Job, QueueError> {
        let raw = self
            .store
            .hget(&self.keys.job(id), "itemData")
            .await?
            .ok_or(QueueError::NoRecord(id))?;
        let job: Job = serde_json::from_str(&raw)?;
        if job.id != id {
            return Err(QueueError::InvalidData {
                requested: id,
                found: job.id,
            });
        }
        Ok(job)
    }

    /// Persist `job`, moving its id out of the `previous` state set.
    pub async fn save(&self, job: &Job, previous: JobState) -> Result<(), QueueError> {
        self.store
            .exec(vec![
                record_op(&self.keys, job)?,
                Op::SMove {
                    from: self.keys.state(previous),
                    to: self.keys.state(job.state),
                    member: job.id.to_string(),
                },
            ])
            .await?;
        Ok(())
    }

    /// Persist a state change. No-op when the state is unchanged.
    pub async fn set_state(&self, job: &mut Job, state: JobState) -> Result<(), QueueError> {
        if job.state == state {
            return Ok(());
        }
        let previous = job.state;
        job.state = state;
        job.update_time = Utc::now();
        self.save(job, previous).await
    }

    /// Apply a concluded attempt: decide the next state, persist it and route the job.
    ///
    /// The attempt's run record must already be closed with
    /// [`Job::finish_run`].
    pub async fn processed(
        &self,
        job: &mut Job,
        success: bool,
        is_timeout: bool,
    ) -> Result<JobState, QueueError> {
        let previous = job.state;
        let next = job.apply_outcome(success, is_timeout, Utc::now());
        self.save(job, previous).await?;
        self.router.route(job).await?;
        tracing::debug!(job_id = %job.id, from = %previous, to = %next, "Job processed");
        Ok(next)
    }

    /// Move a scheduled job back onto its process queue.
    pub async fn activate(&self, id: JobId) -> Result<Job, QueueError> {
        let mut job = self.fetch(id).await?;
        if !job.state.is_scheduled() {
            return Err(QueueError::InvalidState {
                id,
                state: job.state,
            });
        }
        let previous = job.state;
        job.state = JobState::Queued;
        job.scheduled_for = None;
        job.update_time = Utc::now();
        self.save(&job, previous).await?;
        self.router.route(&mut job).await?;
        Ok(job)
    }

    /// Delete a finished job's record.
    ///
    /// Returns `false` when purging is disabled, the record is already gone,
    /// or the job has not finished.
    pub async fn purge(&self, id: JobId) -> Result<bool, QueueError> {
        if !self.settings.current().purge {
            return Ok(false);
        }
        let job = match self.fetch(id).await {
            Ok(job) => job,
            Err(QueueError::NoRecord(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !job.state.is_complete() {
            tracing::warn!(job_id = %id, state = %job.state, "Refusing to purge unfinished job");
            return Ok(false);
        }

        let member = id.to_string();
        self.store
            .exec(vec![
                Op::Del { key: self.keys.job(id) },
                Op::SRem {
                    key: self.keys.state(job.state),
                    member: member.clone(),
                },
                Op::ZRem {
                    key: self.keys.time_index(),
                    member,
                },
            ])
            .await?;
        self.bus.emit(JobEvent::Purged {
            job_id: id,
            name: job.name,
            timestamp: Utc::now(),
        });
        tracing::debug!(job_id = %id, "Job purged");
        Ok(true)
    }

    /// Number of jobs currently in each state.
    pub async fn count_by_state(&self) -> Result<HashMap<JobState, u64>, QueueError> {
        let mut counts = HashMap::new();
        for state in JobState::ALL {
            counts.insert(state, self.store.scard(&self.keys.state(state)).await?);
        }
        Ok(counts)
    }

    /// Job ids waiting in the process list for `name`.
    pub async fn queue_length(&self, name: &str) -> Result<u64, QueueError> {
        Ok(self.store.llen(&self.keys.queue(name)).await?)
    }

    /// Job ids waiting in a time-ordered set.
    pub async fn scheduled_count(&self, set: ScheduleSet) -> Result<u64, QueueError> {
        Ok(self.store.zcard(&self.keys.schedule_set(set)).await?)
    }
}
