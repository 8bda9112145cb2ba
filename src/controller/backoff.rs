//! Requeue backoff
//!
//! Bounded exponential backoff plus a per-object attempt counter shared by
//! the reconcilers and the controller error policy.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Calculate exponential backoff delay
///
/// `base * 2^attempt`, capped at `max`. The exponent is clamped so large
/// attempt counts cannot overflow.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_secs = base.as_secs().max(1);
    let delay_secs = base_secs.saturating_mul(2_u64.saturating_pow(attempt.min(10)));
    Duration::from_secs(delay_secs.min(max.as_secs().max(base_secs)))
}

/// Consecutive-failure counters keyed by object identity
///
/// Entries live only in memory; an operator restart starts every object
/// from attempt zero again.
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity key for an object of `kind` in `namespace`
    pub fn key(kind: &str, namespace: &str, name: &str) -> String {
        format!("{kind}/{namespace}/{name}")
    }

    /// Record a failure and return how many attempts preceded it
    pub fn bump(&self, key: &str) -> u32 {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = attempts.entry(key.to_string()).or_insert(0);
        let previous = *entry;
        *entry = entry.saturating_add(1);
        previous
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}
