//! Job persistence and routing.

mod job_repo;
mod queue_repo;

pub use job_repo::{Created, JobStore};
pub use queue_repo::{DEFAULT_SCHEDULE_DELAY, QueueRouter, schedule_delay};

use queue_core::{Job, Keys, QueueError};

use crate::store::Op;

/// Hash write holding the full job record.
pub(crate) fn record_op(keys: &Keys, job: &Job) -> Result<Op, QueueError> {
    let item_data = serde_json::to_string(job)?;
    Ok(Op::HSet {
        key: keys.job(job.id),
        fields: vec![
            ("id".to_string(), job.id.to_string()),
            ("name".to_string(), job.name.clone()),
            ("createTime".to_string(), job.create_time.timestamp_millis().to_string()),
            ("updateTime".to_string(), job.update_time.timestamp_millis().to_string()),
            ("state".to_string(), job.state.to_string()),
            ("itemData".to_string(), item_data),
        ],
    })
}
