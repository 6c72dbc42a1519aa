//! Per-Interconnect exponential backoff for transient reconcile failures
//!
//! Delays double with each consecutive failure of the same key, get jittered
//! by 0.5x to 1.5x, and never exceed the configured cap. There is no retry
//! budget: callers keep requeueing at the cap until the key succeeds.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key`, returning the requeue delay and the number
    /// of consecutive failures so far
    pub fn next_delay(&self, key: &str) -> (Duration, u32) {
        let attempt = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = failures.entry(key.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.delay_for(attempt).as_secs_f64() * jitter);
        (delay.min(self.max), attempt)
    }

    /// Un-jittered delay for the given attempt number (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Forget failures for `key` after a successful pass
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}
