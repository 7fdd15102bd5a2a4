//! Actor system for the job queue.
//!
//! This crate provides the Ractor-based actors that consume and schedule jobs.
//!
//! # Architecture
//!
//! - `PoolActor` - Supervises a group of workers, their throttle and the guard audit
//! - `WorkerActor` - One sequential dequeue-and-process loop
//! - `SchedulerActor` - Re-activates scheduled jobs and purges finished ones
//!
//! # Usage
//!
//! ```ignore
//! use actors::{spawn_pool, start_scheduler};
//!
//! let scheduler = start_scheduler(jobs.clone()).await?;
//! let pool = spawn_pool(vec!["email".into()], 4, jobs, Arc::new(|ctx: JobContext| async move {
//!     send_email(ctx.data()).await.map_err(|e| e.to_string())
//! })).await?;
//!
//! pool.dispose().await;
//! scheduler.dispose().await;
//! ```

mod guard;
mod handler;
mod messages;
mod pool_actor;
mod scheduler;
mod throttle;
mod worker_actor;

pub use guard::{GuardReport, InFlight, audit};
pub use handler::{HandlerFuture, HandlerResult, JobContext, JobHandler};
pub use messages::{PoolMessage, SchedulerMessage, WorkerMessage};
pub use pool_actor::{PoolActor, PoolArgs, PoolId, PoolStats, WorkerPoolHandle, spawn_pool};
pub use scheduler::{SchedulerActor, SchedulerHandle, arm_delay, start_scheduler};
pub use throttle::Throttle;
pub use worker_actor::{PANIC_MESSAGE, WorkerActor, WorkerArgs, WorkerPhase};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
