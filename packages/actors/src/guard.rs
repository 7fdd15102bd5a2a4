//! Periodic audit of a worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use queue_core::JobId;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::throttle::Throttle;

/// A job currently held by one of the pool's workers.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub worker_id: String,
    pub started: Instant,
    pub timeout: Duration,
    /// Wakes the worker's timeout branch.
    pub force: Arc<Notify>,
}

/// Findings of one audit.
#[derive(Debug, Default, PartialEq)]
pub struct GuardReport {
    /// Jobs held past `factor` times their timeout.
    pub stuck: Vec<JobId>,
    /// In-flight count, when it exceeds the pool's capacity.
    pub over_capacity: Option<usize>,
    /// The throttle has outlived `factor` times its timeout.
    pub stale_throttle: bool,
}

impl GuardReport {
    pub fn is_clean(&self) -> bool {
        self.stuck.is_empty() && self.over_capacity.is_none() && !self.stale_throttle
    }
}

pub fn audit(
    in_flight: &HashMap<JobId, InFlight>,
    capacity: usize,
    throttle: &Throttle,
    factor: f64,
    now: Instant,
) -> GuardReport {
    let mut stuck: Vec<JobId> = in_flight
        .iter()
        .filter(|(_, held)| now.duration_since(held.started) > held.timeout.mul_f64(factor))
        .map(|(id, _)| *id)
        .collect();
    stuck.sort();

    GuardReport {
        stuck,
        over_capacity: (in_flight.len() > capacity).then_some(in_flight.len()),
        stale_throttle: throttle.overdue(now, factor),
    }
}
