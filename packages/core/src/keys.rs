//! State registry: where every job state lives in the store.

use serde::{Deserialize, Serialize};

use crate::{JobId, JobState};

/// Time-ordered sets polled by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleSet {
    /// Delayed, retrying and ghosted jobs waiting to be re-queued.
    Scheduled,
    /// Finished jobs waiting to be deleted.
    ScheduledPurge,
}

impl ScheduleSet {
    pub const ALL: [ScheduleSet; 2] = [ScheduleSet::Scheduled, ScheduleSet::ScheduledPurge];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleSet::Scheduled => "scheduled",
            ScheduleSet::ScheduledPurge => "scheduled-purge",
        }
    }
}

impl std::fmt::Display for ScheduleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key and channel layout for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Atomic counter handing out job ids.
    pub fn counter(&self) -> String {
        format!("{}:id", self.namespace)
    }

    /// Hash holding a job record.
    pub fn job(&self, id: JobId) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    /// Process list a worker pops from.
    pub fn queue(&self, name: &str) -> String {
        format!("{}:queue:{}", self.namespace, name)
    }

    pub fn schedule_set(&self, set: ScheduleSet) -> String {
        format!("{}:{}", self.namespace, set.as_str())
    }

    /// Set of job ids currently in `state`.
    pub fn state(&self, state: JobState) -> String {
        format!("{}:state:{}", self.namespace, state.as_str())
    }

    /// Sorted set of job ids scored by create time.
    pub fn time_index(&self) -> String {
        format!("{}:time-index", self.namespace)
    }

    pub fn create_channel(&self) -> String {
        format!("{}:create", self.namespace)
    }

    pub fn queued_channel(&self) -> String {
        format!("{}:queued", self.namespace)
    }

    pub fn success_channel(&self, name: &str) -> String {
        format!("{}:success:{}", self.namespace, name)
    }

    pub fn fail_channel(&self, name: &str) -> String {
        format!("{}:fail:{}", self.namespace, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_namespace() {
        let keys = Keys::new("hq");
        assert_eq!(keys.counter(), "hq:id");
        assert_eq!(keys.job(JobId(7)), "hq:job:7");
        assert_eq!(keys.queue("mail"), "hq:queue:mail");
        assert_eq!(keys.schedule_set(ScheduleSet::Scheduled), "hq:scheduled");
        assert_eq!(keys.schedule_set(ScheduleSet::ScheduledPurge), "hq:scheduled-purge");
        assert_eq!(keys.state(JobState::Ghost), "hq:state:ghost");
        assert_eq!(keys.time_index(), "hq:time-index");
        assert_eq!(keys.success_channel("mail"), "hq:success:mail");
        assert_eq!(keys.fail_channel("mail"), "hq:fail:mail");
    }
}
