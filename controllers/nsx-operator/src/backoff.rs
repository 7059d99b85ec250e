//! # Requeue Backoff
//!
//! Exponential backoff for requeueing failed reconciliations, tracked per
//! object key. Errors a user has to fix (pool exhausted, invalid spec) use a
//! separate, slower class so they are not retried in a hot loop.
//!
//! Transient sequence: 1s, 2s, 4s, ... 300s (max).
//! User-actionable sequence: 60s, 120s, 240s, ... 1800s (max).

use crate::error::RetryClass;
use crate::resource::ObjectKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Exponential backoff calculator
///
/// Each backoff doubles the previous one, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First backoff value in seconds (for reset)
    min_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl ExponentialBackoff {
    /// Create a new backoff with minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Backoff for transient errors
    #[must_use]
    pub fn transient() -> Self {
        Self::new(1, 300)
    }

    /// Backoff for errors only a spec change can fix
    #[must_use]
    pub fn user_actionable() -> Self {
        Self::new(60, 1800)
    }

    /// Backoff for a retry class
    #[must_use]
    pub fn for_class(class: RetryClass) -> Self {
        match class {
            RetryClass::Transient => Self::transient(),
            RetryClass::UserActionable => Self::user_actionable(),
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;
        self.current_seconds = self.current_seconds.saturating_mul(2).min(self.max_seconds);
        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current_seconds = self.min_seconds;
    }
}

/// Per-key backoff state
///
/// A key that switches class starts the new class from its minimum.
#[derive(Debug, Default)]
pub struct BackoffTracker {
    states: Mutex<HashMap<ObjectKey, (RetryClass, ExponentialBackoff)>>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next requeue delay for a key that failed with `class`
    pub fn next(&self, key: &ObjectKey, class: RetryClass) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.clone())
            .or_insert_with(|| (class, ExponentialBackoff::for_class(class)));
        if state.0 != class {
            *state = (class, ExponentialBackoff::for_class(class));
        }
        state.1.next_backoff()
    }

    /// Forget a key after a successful reconcile
    pub fn reset(&self, key: &ObjectKey) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::transient();

        let seconds: Vec<u64> = (0..11).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(seconds, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::user_actionable();

        assert_eq!(backoff.next_backoff(), Duration::from_secs(60));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(120));
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(60));
    }

    #[test]
    fn test_tracker_is_per_key() {
        let tracker = BackoffTracker::new();
        let a = ObjectKey::new("ns", "a");
        let b = ObjectKey::new("ns", "b");

        assert_eq!(tracker.next(&a, RetryClass::Transient), Duration::from_secs(1));
        assert_eq!(tracker.next(&a, RetryClass::Transient), Duration::from_secs(2));
        assert_eq!(tracker.next(&b, RetryClass::Transient), Duration::from_secs(1));

        tracker.reset(&a);
        assert_eq!(tracker.next(&a, RetryClass::Transient), Duration::from_secs(1));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_tracker_class_switch_restarts_sequence() {
        let tracker = BackoffTracker::new();
        let key = ObjectKey::new("ns", "a");

        tracker.next(&key, RetryClass::Transient);
        tracker.next(&key, RetryClass::Transient);
        assert_eq!(tracker.next(&key, RetryClass::UserActionable), Duration::from_secs(60));
        assert_eq!(tracker.next(&key, RetryClass::Transient), Duration::from_secs(1));
    }
}
