//! Retry delay schedule for webhook delivery.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delays between delivery attempts, in milliseconds.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 3] = [1000, 2000, 4000];

/// Explicit table of delays between delivery attempts.
///
/// The delay after attempt `n` is entry `n - 1`; attempts past the end of the
/// table reuse the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySchedule {
    delays_ms: Vec<u64>,
}

impl RetrySchedule {
    /// Creates a schedule from millisecond delays.
    pub fn new(delays_ms: impl Into<Vec<u64>>) -> Self {
        Self {
            delays_ms: delays_ms.into(),
        }
    }

    /// Returns the delay to wait after `attempts` failed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let idx = (attempts.saturating_sub(1) as usize).min(self.delays_ms.len().saturating_sub(1));
        Duration::from_millis(self.delays_ms.get(idx).copied().unwrap_or(0))
    }

    /// Returns the configured delays.
    pub fn delays_ms(&self) -> &[u64] {
        &self.delays_ms
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_DELAYS_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.delay_for(1), Duration::from_millis(1000));
        assert_eq!(schedule.delay_for(2), Duration::from_millis(2000));
        assert_eq!(schedule.delay_for(3), Duration::from_millis(4000));
        assert_eq!(schedule.delay_for(7), Duration::from_millis(4000));
    }

    #[test]
    fn test_zero_attempts_uses_first_entry() {
        assert_eq!(RetrySchedule::default().delay_for(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_empty_schedule() {
        assert_eq!(RetrySchedule::new(Vec::new()).delay_for(2), Duration::ZERO);
    }
}
