//! Job domain types for work items in the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned identifier for a job, taken from the namespace counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Parse a job ID from its stored string form.
    pub fn parse(s: &str) -> Result<Self, std::num::ParseIntError> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created and waiting in a process queue.
    #[default]
    New,
    /// Re-activated by the scheduler and waiting in a process queue.
    Queued,
    /// Parked in the scheduled set until its delay elapses.
    Delayed,
    /// Held by a worker.
    Processing,
    /// Reported failure, waiting for its retry interval.
    Retry,
    /// Timed out without a report, waiting for its ghost interval.
    Ghost,
    /// Finished successfully.
    Success,
    /// Finished unsuccessfully.
    Fail,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::New,
        JobState::Queued,
        JobState::Delayed,
        JobState::Processing,
        JobState::Retry,
        JobState::Ghost,
        JobState::Success,
        JobState::Fail,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_complete(&self) -> bool {
        matches!(self, JobState::Success | JobState::Fail)
    }

    /// Check if the scheduler is responsible for re-activating the job.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, JobState::Delayed | JobState::Retry | JobState::Ghost)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Queued => "queued",
            JobState::Delayed => "delayed",
            JobState::Processing => "processing",
            JobState::Retry => "retry",
            JobState::Ghost => "ghost",
            JobState::Success => "success",
            JobState::Fail => "fail",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Processing,
    Success,
    Fail,
    Ghost,
}

/// How a worker attempt concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(String),
    TimedOut,
}

impl Outcome {
    pub const TIMEOUT_MESSAGE: &'static str = "processing timed out";

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Outcome::TimedOut)
    }

    pub fn run_state(&self) -> RunState {
        match self {
            Outcome::Success => RunState::Success,
            Outcome::Failed(_) => RunState::Fail,
            Outcome::TimedOut => RunState::Ghost,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Outcome::Success => None,
            Outcome::Failed(message) => Some(message.clone()),
            Outcome::TimedOut => Some(Self::TIMEOUT_MESSAGE.to_string()),
        }
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessItem {
    /// 1-based attempt index.
    pub count: u32,
    pub start_time: DateTime<Utc>,
    /// Elapsed milliseconds, unset while the attempt is running.
    pub process_time: Option<u64>,
    /// Timeout in force for this attempt (milliseconds).
    pub process_timeout: u64,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Resolved execution policy carried by every job.
///
/// Intervals and the initial delay are in seconds, timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
    pub process_timeout: u64,
    pub retry: bool,
    pub retry_times: u32,
    pub retry_interval: f64,
    pub ghost_retry: bool,
    pub ghost_times: u32,
    pub ghost_interval: f64,
    pub hotjob: bool,
    pub hotjob_timeout: u64,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            delay: None,
            process_timeout: 60_000,
            retry: true,
            retry_times: 3,
            retry_interval: 5.0,
            ghost_retry: true,
            ghost_times: 1,
            ghost_interval: 30.0,
            hotjob: false,
            hotjob_timeout: 180_000,
        }
    }
}

/// Producer-supplied overrides; unset fields fall back to the configured policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub delay: Option<f64>,
    pub process_timeout: Option<u64>,
    pub retry: Option<bool>,
    pub retry_times: Option<u32>,
    pub retry_interval: Option<f64>,
    pub ghost_retry: Option<bool>,
    pub ghost_times: Option<u32>,
    pub ghost_interval: Option<f64>,
    pub hotjob: Option<bool>,
    pub hotjob_timeout: Option<u64>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the job back for `seconds` before its first activation.
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = Some(seconds);
        self
    }

    /// Set the processing timeout in milliseconds.
    pub fn with_process_timeout(mut self, millis: u64) -> Self {
        self.process_timeout = Some(millis);
        self
    }

    /// Retry reported failures `times` times, `interval` seconds apart.
    pub fn with_retry(mut self, times: u32, interval: f64) -> Self {
        self.retry = Some(true);
        self.retry_times = Some(times);
        self.retry_interval = Some(interval);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = Some(false);
        self
    }

    /// Retry timed-out attempts `times` times, `interval` seconds apart.
    pub fn with_ghost_retry(mut self, times: u32, interval: f64) -> Self {
        self.ghost_retry = Some(true);
        self.ghost_times = Some(times);
        self.ghost_interval = Some(interval);
        self
    }

    pub fn without_ghost_retry(mut self) -> Self {
        self.ghost_retry = Some(false);
        self
    }

    /// Ask for a completion notification, waiting at most `timeout_ms`.
    pub fn with_hotjob(mut self, timeout_ms: u64) -> Self {
        self.hotjob = Some(true);
        self.hotjob_timeout = Some(timeout_ms);
        self
    }

    /// Merge these overrides onto the configured defaults.
    pub fn resolve(&self, defaults: &JobPolicy) -> JobPolicy {
        JobPolicy {
            delay: self.delay.or(defaults.delay),
            process_timeout: self.process_timeout.unwrap_or(defaults.process_timeout),
            retry: self.retry.unwrap_or(defaults.retry),
            retry_times: self.retry_times.unwrap_or(defaults.retry_times),
            retry_interval: self.retry_interval.unwrap_or(defaults.retry_interval),
            ghost_retry: self.ghost_retry.unwrap_or(defaults.ghost_retry),
            ghost_times: self.ghost_times.unwrap_or(defaults.ghost_times),
            ghost_interval: self.ghost_interval.unwrap_or(defaults.ghost_interval),
            hotjob: self.hotjob.unwrap_or(defaults.hotjob),
            hotjob_timeout: self.hotjob_timeout.unwrap_or(defaults.hotjob_timeout),
        }
    }
}

/// A job represents a unit of work to be executed by the queue system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the process queue this job belongs to.
    pub name: String,
    /// Job payload as JSON.
    #[serde(default)]
    pub data: serde_json::Value,
    pub state: JobState,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub success: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub policy: JobPolicy,
    /// When a delayed, retrying or ghosted job is due back in a process queue.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub runs: Vec<ProcessItem>,
    #[serde(default)]
    pub total_process_time: Option<u64>,
    /// Worker that claimed the latest attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Job {
    /// Create a job that has not been persisted yet.
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        data: serde_json::Value,
        policy: JobPolicy,
    ) -> Self {
        let now = Utc::now();
        let state = if policy.delay.is_some() {
            JobState::Delayed
        } else {
            JobState::New
        };
        Self {
            id,
            name: name.into(),
            data,
            state,
            complete: false,
            success: false,
            create_time: now,
            update_time: now,
            finish_time: None,
            policy,
            scheduled_for: None,
            last_error: None,
            runs: Vec::new(),
            total_process_time: None,
            worker: None,
        }
    }

    /// Record the start of a new attempt by `worker`.
    pub fn begin_run(&mut self, worker: &str, now: DateTime<Utc>) {
        let count = self.runs.len() as u32 + 1;
        self.runs.push(ProcessItem {
            count,
            start_time: now,
            process_time: None,
            process_timeout: self.policy.process_timeout,
            state: RunState::Processing,
            error_message: None,
        });
        self.worker = Some(worker.to_string());
        self.update_time = now;
    }

    /// Close the latest attempt with its outcome and elapsed time.
    pub fn finish_run(&mut self, outcome: &Outcome, elapsed: Duration, now: DateTime<Utc>) {
        let error_message = outcome.error_message();
        if let Some(run) = self.runs.last_mut() {
            run.process_time = Some(elapsed.as_millis() as u64);
            run.state = outcome.run_state();
            run.error_message = error_message.clone();
        }
        if error_message.is_some() {
            self.last_error = error_message;
        }
        self.update_time = now;
    }

    /// Count earlier attempts (excluding the latest one) that ended in `state`.
    pub fn prior_runs(&self, state: RunState) -> u32 {
        self.runs
            .iter()
            .rev()
            .skip(1)
            .filter(|run| run.state == state)
            .count() as u32
    }

    /// Decide the state that follows a concluded attempt.
    ///
    /// Reported failures and timeouts are counted independently: retries
    /// look at earlier `fail` runs, ghost retries at earlier `ghost` runs.
    pub fn next_state(&self, success: bool, is_timeout: bool) -> JobState {
        if success {
            JobState::Success
        } else if !is_timeout {
            if self.policy.retry && self.prior_runs(RunState::Fail) < self.policy.retry_times {
                JobState::Retry
            } else {
                JobState::Fail
            }
        } else if self.policy.ghost_retry
            && self.prior_runs(RunState::Ghost) < self.policy.ghost_times
        {
            JobState::Ghost
        } else {
            JobState::Fail
        }
    }

    /// Apply a concluded attempt, finalizing the job when it reaches a terminal state.
    pub fn apply_outcome(&mut self, success: bool, is_timeout: bool, now: DateTime<Utc>) -> JobState {
        let next = self.next_state(success, is_timeout);
        self.state = next;
        self.update_time = now;
        if next.is_complete() {
            self.complete = true;
            self.success = next == JobState::Success;
            self.finish_time.get_or_insert(now);
            self.total_process_time = Some(self.runs.iter().filter_map(|r| r.process_time).sum());
        }
        next
    }

    /// Build the public view of this job.
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            name: self.name.clone(),
            data: self.data.clone(),
            state: self.state,
            complete: self.complete,
            success: self.success,
            create_time: self.create_time,
            update_time: self.update_time,
            finish_time: self.finish_time,
            policy: self.policy.clone(),
            scheduled_for: self.scheduled_for,
            last_error: self.last_error.clone(),
            runs: self.runs.clone(),
            total_process_time: self.total_process_time,
        }
    }
}

/// Public record of a job, as handed to producers, workers and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub state: JobState,
    pub complete: bool,
    pub success: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub policy: JobPolicy,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub runs: Vec<ProcessItem>,
    #[serde(default)]
    pub total_process_time: Option<u64>,
}
