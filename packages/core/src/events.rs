//! Event types for in-process observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobView};

/// Events emitted by the queue router and job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new job was routed for the first time.
    Created {
        job: Box<JobView>,
        timestamp: DateTime<Utc>,
    },
    /// A job id was pushed onto its process queue.
    Queued {
        job: Box<JobView>,
        timestamp: DateTime<Utc>,
    },
    /// A job finished successfully.
    Completed {
        job: Box<JobView>,
        timestamp: DateTime<Utc>,
    },
    /// An attempt failed or timed out.
    Failed {
        job: Box<JobView>,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A finished job's record was deleted.
    Purged {
        job_id: JobId,
        name: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Created { timestamp, .. } => *timestamp,
            JobEvent::Queued { timestamp, .. } => *timestamp,
            JobEvent::Completed { timestamp, .. } => *timestamp,
            JobEvent::Failed { timestamp, .. } => *timestamp,
            JobEvent::Purged { timestamp, .. } => *timestamp,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Created { job, .. }
            | JobEvent::Queued { job, .. }
            | JobEvent::Completed { job, .. }
            | JobEvent::Failed { job, .. } => job.id,
            JobEvent::Purged { job_id, .. } => *job_id,
        }
    }

    /// Name of the process queue the job belongs to.
    pub fn name(&self) -> &str {
        match self {
            JobEvent::Created { job, .. }
            | JobEvent::Queued { job, .. }
            | JobEvent::Completed { job, .. }
            | JobEvent::Failed { job, .. } => &job.name,
            JobEvent::Purged { name, .. } => name,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::Created { job, .. } => format!("Job {} created on '{}'", job.id, job.name),
            JobEvent::Queued { job, .. } => format!("Job {} queued on '{}'", job.id, job.name),
            JobEvent::Completed { job, .. } => match job.total_process_time {
                Some(ms) => format!("Job {} completed in {}ms", job.id, ms),
                None => format!("Job {} completed", job.id),
            },
            JobEvent::Failed {
                job, will_retry, ..
            } => {
                let error = job.last_error.as_deref().unwrap_or("unknown error");
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", job.id, error, retry)
            }
            JobEvent::Purged { job_id, .. } => format!("Job {} purged", job_id),
        }
    }
}
