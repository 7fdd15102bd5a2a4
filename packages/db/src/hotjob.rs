//! Completion notifications for hotjobs.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{Job, JobId, JobState, JobView, Keys, QueueError};
use tokio::sync::oneshot;

use crate::store::{PubSubMessage, Store};

/// Producer-side handle that settles once with the job's outcome.
#[derive(Debug)]
pub struct HotjobHandle {
    job_id: JobId,
    rx: oneshot::Receiver<Result<JobView, QueueError>>,
}

impl HotjobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the job to succeed, fail, or run out of time.
    pub async fn wait(self) -> Result<JobView, QueueError> {
        self.rx.await.map_err(|_| QueueError::Disposed)?
    }
}

/// Arms hotjob waits on the success and fail channels of a job's name.
pub struct HotjobNotifier;

impl HotjobNotifier {
    /// Subscribe for `job`'s outcome.
    ///
    /// Returns `None` unless the job asked for a hotjob and is still `new`.
    /// The subscription is live when this returns, so the job can be
    /// pushed right after without missing its completion.
    pub async fn arm(
        store: &Arc<dyn Store>,
        keys: &Keys,
        job: &Job,
    ) -> Result<Option<HotjobHandle>, QueueError> {
        if !job.policy.hotjob || job.state != JobState::New {
            return Ok(None);
        }

        let success_channel = keys.success_channel(&job.name);
        let fail_channel = keys.fail_channel(&job.name);
        let mut subscription = store
            .subscribe(vec![success_channel.clone(), fail_channel])
            .await?;

        let (tx, rx) = oneshot::channel();
        let job_id = job.id;
        let timeout_ms = job.policy.hotjob_timeout;
        tracing::debug!(job_id = %job_id, timeout_ms, "Hotjob armed");

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
            tokio::pin!(deadline);

            let result = loop {
                tokio::select! {
                    message = subscription.next() => match message {
                        Some(message) => {
                            if let Some(result) = settle(&message, job_id, &success_channel) {
                                break result;
                            }
                        }
                        None => break Err(QueueError::Disposed),
                    },
                    _ = &mut deadline => {
                        break Err(QueueError::Timeout(format!(
                            "hotjob {} did not complete within {}ms",
                            job_id, timeout_ms
                        )));
                    }
                }
            };

            subscription.close();
            if tx.send(result).is_err() {
                tracing::debug!(job_id = %job_id, "Hotjob handle dropped before completion");
            }
        });

        Ok(Some(HotjobHandle { job_id, rx }))
    }
}

/// Outcome carried by `message` if it concerns `job_id`.
fn settle(
    message: &PubSubMessage,
    job_id: JobId,
    success_channel: &str,
) -> Option<Result<JobView, QueueError>> {
    let view: JobView = match serde_json::from_str(&message.payload) {
        Ok(view) => view,
        Err(e) => {
            tracing::warn!("Ignoring malformed message on {}: {}", message.channel, e);
            return None;
        }
    };
    if view.id != job_id {
        return None;
    }
    if message.channel == success_channel {
        Some(Ok(view))
    } else {
        let message = view.last_error.unwrap_or_else(|| "job failed".to_string());
        Some(Err(QueueError::JobFailed { id: job_id, message }))
    }
}
