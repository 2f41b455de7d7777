//! Application configuration.
//!
//! Every section starts from its environment defaults; values present in the
//! TOML file override them key by key.

use serde::{Deserialize, Serialize};

use dxp_events::BusConfig;
use dxp_resources::ResourceConfig;
use dxp_webhooks::WebhookConfig;

/// Process-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub resources: ResourceConfig,
    pub webhooks: WebhookConfig,
}

impl AppConfig {
    /// Reads every section from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::default(),
            bus: BusConfig::from_env().map_err(|e| ConfigError::EnvError(e.to_string()))?,
            resources: ResourceConfig::default(),
            webhooks: WebhookConfig::from_env(),
        })
    }

    /// Parses TOML on top of `base`.
    pub fn from_toml_str(content: &str, base: AppConfig) -> Result<Self, ConfigError> {
        let overlay: toml::Table =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let toml::Value::Table(mut merged) =
            toml::Value::try_from(&base).map_err(|e| ConfigError::ParseError(e.to_string()))?
        else {
            return Err(ConfigError::ParseError("configuration did not serialize to a table".into()));
        };
        merge(&mut merged, overlay);
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))
    }
}

/// Loads configuration from a TOML file on top of the environment.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(format!("{}: {}", path, e)))?;
    AppConfig::from_toml_str(&content, AppConfig::from_env()?)
}

/// Recursively overlays `overlay` onto `base`; tables merge, other values replace.
fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => merge(existing, incoming),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Environment error: {0}")]
    EnvError(String),
}
