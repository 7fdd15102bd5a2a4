//! Dequeue backpressure after repeated store failures.

use std::collections::VecDeque;
use std::time::Duration;

use queue_core::WorkerConfig;
use tokio::time::Instant;

/// Rolling-window failure counter that suspends dequeues when tripped.
#[derive(Debug)]
pub struct Throttle {
    failures: VecDeque<Instant>,
    limit: usize,
    window: Duration,
    timeout: Duration,
    engaged_at: Option<Instant>,
    generation: u64,
}

impl Throttle {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            failures: VecDeque::new(),
            limit: config.throttle_failures,
            window: Duration::from_millis(config.throttle_window_ms),
            timeout: Duration::from_millis(config.throttle_timeout_ms),
            engaged_at: None,
            generation: 0,
        }
    }

    /// Record a failed dequeue. Returns `true` when this failure engages the throttle.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);

        if self.engaged_at.is_none() && self.failures.len() > self.limit {
            self.engaged_at = Some(now);
            self.generation += 1;
            self.failures.clear();
            return true;
        }
        false
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged_at.is_some()
    }

    /// Identifies the current engagement so stale release timers can be ignored.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// How long dequeues stay suspended once engaged.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn release(&mut self) {
        self.engaged_at = None;
        self.failures.clear();
    }

    /// Engaged for longer than `factor` times its timeout.
    pub fn overdue(&self, now: Instant, factor: f64) -> bool {
        self.engaged_at
            .is_some_and(|at| now.duration_since(at) > self.timeout.mul_f64(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig {
            throttle_failures: 2,
            throttle_window_ms: 1_000,
            throttle_timeout_ms: 5_000,
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn engages_after_limit_exceeded_in_window() {
        let mut throttle = Throttle::new(&config());
        let start = Instant::now();
        assert!(!throttle.record_failure(start));
        assert!(!throttle.record_failure(start + Duration::from_millis(100)));
        assert!(throttle.record_failure(start + Duration::from_millis(200)));
        assert!(throttle.is_engaged());
        assert_eq!(throttle.generation(), 1);
        assert!(!throttle.record_failure(start + Duration::from_millis(300)));
    }

    #[test]
    fn old_failures_leave_the_window() {
        let mut throttle = Throttle::new(&config());
        let start = Instant::now();
        throttle.record_failure(start);
        throttle.record_failure(start + Duration::from_millis(100));
        assert!(!throttle.record_failure(start + Duration::from_millis(1_500)));
        assert!(!throttle.is_engaged());
    }

    #[test]
    fn overdue_after_factor_times_timeout() {
        let mut throttle = Throttle::new(&config());
        let start = Instant::now();
        for i in 0..3 {
            throttle.record_failure(start + Duration::from_millis(i));
        }
        assert!(!throttle.overdue(start + Duration::from_secs(7), 1.5));
        assert!(throttle.overdue(start + Duration::from_secs(8), 1.5));
        throttle.release();
        assert!(!throttle.overdue(start + Duration::from_secs(8), 1.5));
    }
}
