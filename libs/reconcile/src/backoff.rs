//! Per-key exponential backoff.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any single delay.
    pub max: Duration,

    /// Jitter fraction (0.0 to 1.0) applied symmetrically around the delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay for a key that has already failed `attempt` times.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(62) as i32);
        let max_nanos = self.max.as_nanos() as f64;
        let delay = (self.base.as_nanos() as f64 * exp).min(max_nanos);

        let delay = if self.jitter > 0.0 {
            let spread = delay * self.jitter.min(1.0);
            let offset = rand::rng().random_range(-spread..=spread);
            (delay + offset).max(0.0)
        } else {
            delay
        };

        Duration::from_nanos(delay.round() as u64)
    }
}

/// Tracks failure counts per key and turns them into delays.
#[derive(Debug)]
pub(crate) struct RateLimiter<K> {
    policy: BackoffPolicy,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Delay for the next retry of `key`; counts it as a requeue.
    pub(crate) fn when(&mut self, key: &K) -> Duration {
        let count = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.policy.delay(*count);
        *count += 1;
        delay
    }

    pub(crate) fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub(crate) fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}
