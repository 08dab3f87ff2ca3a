use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Shard key used when a group does not name its own default.
pub const DEFAULT_SHARD_KEY: &str = "default";

/// Group used when no `default_group` is configured and several groups exist.
pub const DEFAULT_GROUP: &str = "master";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub default_group: Option<String>,
    #[serde(default)]
    pub pool: PoolConfig,
    pub groups: HashMap<String, GroupConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pool-size hint shared by all worker units
    #[serde(default = "default_pool_size")]
    pub size: u32,
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Default acquire timeout in (fractional) seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            workers: default_workers(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl PoolConfig {
    /// Connections per shard pool: the size hint divided across worker units
    pub fn capacity(&self) -> u32 {
        (self.size / self.workers.max(1)).max(1)
    }
}

fn default_pool_size() -> u32 {
    16
}
fn default_workers() -> u32 {
    1
}
fn default_timeout_secs() -> f64 {
    1.0
}
fn default_shard_key() -> String {
    DEFAULT_SHARD_KEY.to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    #[serde(default = "default_shard_key")]
    pub default_key: String,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    pub shards: HashMap<String, ShardConfig>,
}

/// Driver configuration for one shard. Everything except the driver type and
/// the optional acquire timeout is handed to the driver as options.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardConfig {
    #[serde(rename = "type")]
    pub driver: String,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(flatten)]
    pub options: HashMap<String, serde_yaml::Value>,
}

impl ShardConfig {
    pub fn new(driver: &str) -> Self {
        Self {
            driver: driver.to_string(),
            timeout_secs: None,
            options: HashMap::new(),
        }
    }

    /// Add a driver option (useful for building configs in code)
    pub fn with_option(mut self, name: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.options.insert(name.to_string(), value.into());
        self
    }

    /// Decode the driver options into a typed driver config, filling in its defaults
    pub fn driver_options<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let mapping = serde_yaml::to_value(&self.options)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        serde_yaml::from_value(mapping).map_err(|e| {
            ConfigError::ParseError(format!("invalid '{}' driver options: {}", self.driver, e))
        })
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one group must be configured".to_string(),
            ));
        }

        if self.pool.size == 0 || self.pool.workers == 0 {
            return Err(ConfigError::ValidationError(
                "pool.size and pool.workers must be at least 1".to_string(),
            ));
        }
        check_timeout("pool.timeout_secs", self.pool.timeout_secs)?;

        if let Some(default_group) = &self.default_group {
            if !self.groups.contains_key(default_group) {
                return Err(ConfigError::ValidationError(format!(
                    "default_group references unknown group '{}'",
                    default_group
                )));
            }
        }

        for (group_name, group) in &self.groups {
            if group.shards.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Group '{}' has no shards",
                    group_name
                )));
            }
            if !group.shards.contains_key(&group.default_key) {
                return Err(ConfigError::ValidationError(format!(
                    "Group '{}' default_key references unknown shard '{}'",
                    group_name, group.default_key
                )));
            }
            if let Some(secs) = group.timeout_secs {
                check_timeout(&format!("groups.{}.timeout_secs", group_name), secs)?;
            }

            for (key, shard) in &group.shards {
                if shard.driver.trim().is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Shard '{}/{}' has an empty driver type",
                        group_name, key
                    )));
                }
                if let Some(secs) = shard.timeout_secs {
                    check_timeout(&format!("groups.{}.shards.{}.timeout_secs", group_name, key), secs)?;
                }
            }
        }

        Ok(())
    }

    /// Group used when a caller does not name one: the configured default,
    /// else the only group, else "master" when present.
    pub fn default_group(&self) -> Option<&str> {
        if let Some(name) = &self.default_group {
            return Some(name.as_str());
        }
        if self.groups.len() == 1 {
            return self.groups.keys().next().map(String::as_str);
        }
        self.groups
            .get_key_value(DEFAULT_GROUP)
            .map(|(name, _)| name.as_str())
    }

    /// Acquire timeout for a shard: shard override, then group, then pool default
    pub fn acquire_timeout(&self, group: &str, key: &str) -> Duration {
        let group_config = self.groups.get(group);
        let secs = group_config
            .and_then(|g| g.shards.get(key))
            .and_then(|s| s.timeout_secs)
            .or_else(|| group_config.and_then(|g| g.timeout_secs))
            .unwrap_or(self.pool.timeout_secs);
        Duration::from_secs_f64(secs)
    }
}

fn check_timeout(field: &str, secs: f64) -> Result<(), ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::ValidationError(format!(
            "{} must be a positive number of seconds, got {}",
            field, secs
        )));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
