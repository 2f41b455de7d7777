//! Resource manager configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceConfig {
    /// How long a terminal resource survives after completion, in seconds.
    pub cleanup_ttl_secs: u64,
    /// Interval of the cleanup sweep, in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cleanup_ttl_secs: 5 * 60,
            cleanup_interval_secs: 60,
        }
    }
}

impl ResourceConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the TTL of terminal resources.
    pub fn cleanup_ttl(mut self, ttl: Duration) -> Self {
        self.cleanup_ttl_secs = ttl.as_secs();
        self
    }

    /// Sets the sweep interval.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_secs = interval.as_secs();
        self
    }

    /// Returns the TTL of terminal resources.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cleanup_ttl_secs)
    }

    /// Returns the sweep interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}
