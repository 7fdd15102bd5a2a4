//! Job handler trait.

use std::future::Future;
use std::pin::Pin;

use queue_core::{JobId, JobView};
use serde_json::Value;

/// Result type for job handlers. The error string becomes the job's `last_error`.
pub type HandlerResult = Result<(), String>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// What a handler receives for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobView,
    pub worker_id: String,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn data(&self) -> &Value {
        &self.job.data
    }

    /// 1-based index of this attempt.
    pub fn attempt(&self) -> u32 {
        self.job.runs.last().map_or(1, |run| run.count)
    }
}

/// Trait for job handlers.
///
/// Implemented for any `Fn(JobContext) -> impl Future<Output = HandlerResult>`.
pub trait JobHandler: Send + Sync + 'static {
    /// Process one attempt of a job.
    fn handle(&self, ctx: JobContext) -> HandlerFuture;
}

impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: JobContext) -> HandlerFuture {
        Box::pin((self)(ctx))
    }
}
