//! Bus configuration.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EventError, EventResult};

/// Environment variable selecting the bus backend.
pub const ENV_BUS_TYPE: &str = "DXP_EVENT_BUS";
/// Environment variable holding the shared-store connection string.
pub const ENV_REDIS_URL: &str = "DXP_REDIS_URL";
/// Fallback connection-string variable.
pub const ENV_REDIS_URL_FALLBACK: &str = "REDIS_URL";
/// Environment variable holding the tenant/project identifier.
pub const ENV_PROJECT_ID: &str = "DXP_PROJECT_ID";
/// Environment variable toggling fallback to the in-process bus.
pub const ENV_FALLBACK: &str = "DXP_EVENT_BUS_FALLBACK";

/// Bus backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Single-process bus.
    #[default]
    Memory,
    /// Shared pub/sub + sorted-set store (Redis).
    Redis,
}

impl BusBackend {
    /// Returns the selector string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
        }
    }
}

impl std::fmt::Display for BusBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusBackend {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "local" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(EventError::UnknownBusType(other.to_string())),
        }
    }
}

/// Event bus configuration.
///
/// The environment is the default source ([`BusConfig::from_env`]); values
/// set explicitly on the struct override it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Which backend to run.
    pub backend: BusBackend,
    /// Shared-store connection string.
    pub redis_url: Option<String>,
    /// Tenant/project identifier used in topic names.
    pub project_id: String,
    /// Fall back to the in-process bus when the shared store is unusable.
    pub fallback_to_memory: bool,
    /// Maximum events retained in history.
    pub history_max_events: usize,
    /// Maximum age of retained history, in seconds.
    pub history_max_age_secs: u64,
    /// Interval of the in-process history sweep, in seconds.
    pub history_sweep_interval_secs: u64,
    /// Reconnect attempts before the circuit opens.
    pub max_reconnect_attempts: u32,
    /// Base reconnect backoff, in milliseconds.
    pub reconnect_backoff_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            redis_url: None,
            project_id: "default".to_string(),
            fallback_to_memory: true,
            history_max_events: 10_000,
            history_max_age_secs: 24 * 60 * 60,
            history_sweep_interval_secs: 60 * 60,
            max_reconnect_attempts: 10,
            reconnect_backoff_ms: 50,
        }
    }
}

impl BusConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> EventResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EventResult<Self> {
        let mut config = Self::default();

        if let Some(backend) = lookup(ENV_BUS_TYPE) {
            config.backend = backend.parse()?;
        }
        config.redis_url = lookup(ENV_REDIS_URL)
            .or_else(|| lookup(ENV_REDIS_URL_FALLBACK))
            .filter(|u| !u.trim().is_empty());
        if let Some(project) = lookup(ENV_PROJECT_ID).filter(|p| !p.trim().is_empty()) {
            config.project_id = project;
        }
        if let Some(flag) = lookup(ENV_FALLBACK) {
            config.fallback_to_memory = !matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "false" | "0" | "no" | "off"
            );
        }

        Ok(config)
    }

    /// Sets the backend.
    pub fn backend(mut self, backend: BusBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the shared-store connection string.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Sets the project identifier.
    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    /// Sets whether to fall back to the in-process bus.
    pub fn fallback_to_memory(mut self, fallback: bool) -> Self {
        self.fallback_to_memory = fallback;
        self
    }

    /// Sets the history bounds.
    pub fn history_limits(mut self, max_events: usize, max_age: Duration) -> Self {
        self.history_max_events = max_events;
        self.history_max_age_secs = max_age.as_secs();
        self
    }

    /// Returns the maximum history age.
    pub fn history_max_age(&self) -> Duration {
        Duration::from_secs(self.history_max_age_secs)
    }

    /// Returns the history sweep interval.
    pub fn history_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.history_sweep_interval_secs.max(1))
    }

    /// Returns the base reconnect backoff.
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.backend, BusBackend::Memory);
        assert!(config.fallback_to_memory);
        assert_eq!(config.history_max_events, 10_000);
        assert_eq!(config.history_max_age(), Duration::from_secs(86_400));
        assert_eq!(config.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_from_lookup() {
        let config = BusConfig::from_lookup(lookup_from(&[
            (ENV_BUS_TYPE, "Redis"),
            (ENV_REDIS_URL_FALLBACK, "redis://cache:6379"),
            (ENV_PROJECT_ID, "acme"),
            (ENV_FALLBACK, "false"),
        ]))
        .unwrap();

        assert_eq!(config.backend, BusBackend::Redis);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.project_id, "acme");
        assert!(!config.fallback_to_memory);
    }

    #[test]
    fn test_unknown_backend() {
        let result = BusConfig::from_lookup(lookup_from(&[(ENV_BUS_TYPE, "kafka")]));
        assert!(matches!(result, Err(EventError::UnknownBusType(t)) if t == "kafka"));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let parsed: Result<BusConfig, _> =
            serde_json::from_value(serde_json::json!({"backend": "memory", "colour": "blue"}));
        assert!(parsed.is_err());
    }
}
