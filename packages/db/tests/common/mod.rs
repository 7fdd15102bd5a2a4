use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use queue_core::{Job, JobId, JobState, Outcome, QueueConfig, QueueError, Settings};

use db::{EventBus, JobStore, MemoryStore, Store};

/// Job store over a fresh in-memory store.
pub fn job_store(config: QueueConfig) -> (JobStore, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let jobs = JobStore::new(store.clone(), Settings::new(config), EventBus::default());
    (jobs, store)
}

/// Play the worker's part for one attempt on `id`.
pub async fn run_attempt(jobs: &JobStore, id: JobId, outcome: Outcome) -> Result<Job, QueueError> {
    let mut job = jobs.fetch(id).await?;
    jobs.set_state(&mut job, JobState::Processing).await?;
    job.begin_run("test-worker", Utc::now());
    job.finish_run(&outcome, Duration::from_millis(3), Utc::now());
    jobs.processed(&mut job, outcome.is_success(), outcome.is_timeout())
        .await?;
    Ok(job)
}
