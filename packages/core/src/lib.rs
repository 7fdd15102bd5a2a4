//! Core domain types for the job queue system.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobState and ProcessItem for work items and their run history
//! - Keys, the state registry mapping states to store keys and channels
//! - QueueConfig and Settings for process-wide configuration
//! - Events and errors

mod config;
mod error;
mod events;
mod job;
mod keys;

pub use config::{QueueConfig, SchedulerConfig, Settings, WorkerConfig};
pub use error::QueueError;
pub use events::JobEvent;
pub use job::{
    Job, JobId, JobOptions, JobPolicy, JobState, JobView, Outcome, ProcessItem, RunState,
};
pub use keys::{Keys, ScheduleSet};
