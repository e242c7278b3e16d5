//! Per-class queue policy

use forge_model::WorkerClass;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 2_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_FORGOTTEN_CAPACITY: usize = 10_000;

/// Concurrency, retry and retention settings of one worker class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueuePolicy {
    /// Number of worker loops competing for jobs
    pub concurrency: usize,
    /// Attempts before a job fails terminally
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub backoff_initial_ms: u64,
    /// Growth factor applied per further attempt
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay
    pub backoff_max_ms: u64,
    /// Keep completed jobs inspectable
    pub retain_completed: bool,
    /// Keep failed jobs inspectable
    pub retain_failed: bool,
    /// Keys of unretained finished jobs remembered to refuse resubmission;
    /// the oldest are forgotten first
    pub forgotten_capacity: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            retain_completed: true,
            retain_failed: true,
            forgotten_capacity: DEFAULT_FORGOTTEN_CAPACITY,
        }
    }
}

impl QueuePolicy {
    /// Default policy for a worker class
    #[must_use]
    pub fn for_class(class: WorkerClass) -> Self {
        Self {
            concurrency: class.default_capacity(),
            ..Self::default()
        }
    }

    /// With concurrency
    #[inline]
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// With max attempts
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// With backoff parameters
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.backoff_initial_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.backoff_max_ms = max_ms;
        self
    }

    /// With retention
    #[inline]
    #[must_use]
    pub fn with_retention(mut self, completed: bool, failed: bool) -> Self {
        self.retain_completed = completed;
        self.retain_failed = failed;
        self
    }

    /// With the number of unretained job keys remembered
    #[inline]
    #[must_use]
    pub fn with_forgotten_capacity(mut self, capacity: usize) -> Self {
        self.forgotten_capacity = capacity;
        self
    }

    /// Delay after the given failed attempt (1-based)
    ///
    /// `initial * multiplier^(attempt - 1)`, capped at `backoff_max_ms`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let cap = self.backoff_max_ms as f64;
        let millis = if raw.is_finite() { raw.min(cap) } else { cap };
        Duration::from_secs_f64(millis.max(0.0) / 1_000.0)
    }

    /// Every problem with this policy
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.concurrency == 0 {
            problems.push("concurrency must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            problems.push("backoff_multiplier must be at least 1.0".to_string());
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            problems.push("backoff_max_ms must not be below backoff_initial_ms".to_string());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let policy = QueuePolicy::default().with_backoff(2_000, 2.0, 5_000);
        assert_eq!(policy.backoff(1), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(5_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(5_000));
    }

    #[test]
    fn class_defaults_follow_capacity() {
        assert_eq!(QueuePolicy::for_class(WorkerClass::Backend).concurrency, 3);
        assert_eq!(QueuePolicy::for_class(WorkerClass::Security).concurrency, 2);
        assert_eq!(QueuePolicy::for_class(WorkerClass::Testing).max_attempts, 3);
    }

    #[test]
    fn invalid_values_are_all_reported() {
        let policy = QueuePolicy::default()
            .with_concurrency(0)
            .with_max_attempts(0)
            .with_backoff(10, 0.5, 10);
        assert_eq!(policy.problems().len(), 3);
        assert!(QueuePolicy::default().problems().is_empty());
    }
}
