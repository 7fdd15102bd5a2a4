//! Durable job queue.
//!
//! `HotQueue` is the entry point: producers `create` jobs, consumers
//! `process` them with an async handler, and `get` reads a job back.
//!
//! ```ignore
//! use hotqueue::{HotQueue, JobContext, JobOptions, ProcessOptions, QueueConfig};
//!
//! let queue = HotQueue::memory(QueueConfig::default());
//! queue
//!     .process(["email"], ProcessOptions::default(), |ctx: JobContext| async move {
//!         tracing::info!("sending to {}", ctx.data()["to"]);
//!         Ok(())
//!     })
//!     .await?;
//!
//! let created = queue
//!     .create("email", json!({"to": "a@b.c"}), &JobOptions::new().with_hotjob(5_000))
//!     .await?;
//! let finished = created.hotjob.unwrap().wait().await?;
//! ```

mod init;
mod queue;

pub use init::init_tracing;
pub use queue::{HotQueue, ProcessOptions};

// Re-export the types callers need
pub use actors::{HandlerResult, JobContext, JobHandler, PoolStats, WorkerPoolHandle};
pub use db::{Created, HotjobHandle, Store, StoreConfig};
pub use queue_core::{
    JobEvent, JobId, JobOptions, JobPolicy, JobState, JobView, QueueConfig, QueueError,
    SchedulerConfig, Settings, WorkerConfig,
};
