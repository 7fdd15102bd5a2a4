//! Message types for actor communication.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{JobId, ScheduleSet};
use ractor::RpcReplyPort;
use tokio::sync::Notify;

use crate::pool_actor::PoolStats;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Run one dequeue-and-process iteration.
    Pop,

    /// Shutdown the worker.
    Shutdown,
}

/// Messages for the PoolActor.
#[derive(Debug)]
pub enum PoolMessage {
    /// A worker took a job.
    JobStarted {
        job_id: JobId,
        worker_id: String,
        timeout: Duration,
        force: Arc<Notify>,
    },

    /// A worker finished reporting a job.
    JobFinished { job_id: JobId, success: bool },

    /// A dequeue failed against the store.
    PopFailed { worker_id: String, error: String },

    /// The throttle engaged as `generation` has run its course.
    ThrottleExpired { generation: u64 },

    /// Periodic guard tick.
    Audit,

    /// Get pool stats.
    GetStats { reply: RpcReplyPort<PoolStats> },

    /// Stop all workers and the pool.
    Shutdown,
}

/// Messages for the SchedulerActor.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Claim due jobs from every scheduled set.
    Ping,

    /// Cadence settings changed.
    Reconfigure,

    /// A claimed job's timer fired.
    Due { set: ScheduleSet, job_id: JobId },

    /// Shutdown the scheduler.
    Shutdown,
}
