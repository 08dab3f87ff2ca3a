use super::backend::BackendError;
use super::drivers::DriverTable;
use super::metrics::MetricsSnapshot;
use super::pool::{Lease, Pool, PoolError, PoolState};
use crate::config::{Config, ConfigError, GroupConfig, DEFAULT_GROUP};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A lease together with the shard it came from
#[derive(Debug)]
pub struct Checkout {
    pub group: String,
    pub key: String,
    pub lease: Lease,
}

/// State and counters of one materialized pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub driver: String,
    pub state: PoolState,
    pub metrics: MetricsSnapshot,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}/{} connections, {} idle, {} out | acquired {} timeouts {} avg wait {:.2}ms",
            self.name,
            self.driver,
            self.state.connections,
            self.state.capacity,
            self.state.idle,
            self.state.outstanding,
            self.metrics.acquisitions,
            self.metrics.timeouts,
            self.metrics.average_wait_ms
        )
    }
}

/// Named groups of keyed shards, one pool per shard.
///
/// Pools are created on first reference and live as long as the cluster.
pub struct Cluster {
    config: Config,
    drivers: DriverTable,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl Cluster {
    /// Check the configuration against the driver table. Opens no connections.
    pub fn new(config: Config, drivers: DriverTable) -> Result<Self, ClusterError> {
        config.validate()?;

        for (group_name, group) in &config.groups {
            for (key, shard) in &group.shards {
                if !drivers.contains(&shard.driver) {
                    return Err(ClusterError::UnknownDriver {
                        group: group_name.clone(),
                        key: key.clone(),
                        driver: shard.driver.clone(),
                    });
                }
            }
        }

        tracing::info!(
            "🗂️ Cluster configured with {} groups (capacity {} per shard)",
            config.groups.len(),
            config.pool.capacity()
        );

        Ok(Self {
            config,
            drivers,
            pools: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve a group name, substituting the default group
    pub fn resolve_group(&self, group: Option<&str>) -> Result<String, ClusterError> {
        let (name, _) = self.group(group)?;
        Ok(name.to_string())
    }

    /// Resolve `(group, key)`, substituting the default group and the
    /// group's default shard key
    pub fn resolve(&self, group: Option<&str>, key: Option<&str>) -> Result<(String, String), ClusterError> {
        let (group_name, group_config) = self.group(group)?;
        let key = key.unwrap_or(&group_config.default_key);

        if !group_config.shards.contains_key(key) {
            return Err(ClusterError::UnknownShard {
                group: group_name.to_string(),
                key: key.to_string(),
            });
        }

        Ok((group_name.to_string(), key.to_string()))
    }

    fn group(&self, group: Option<&str>) -> Result<(&str, &GroupConfig), ClusterError> {
        let name = match group {
            Some(name) => name,
            None => self.config.default_group().unwrap_or(DEFAULT_GROUP),
        };

        self.config
            .groups
            .get_key_value(name)
            .map(|(name, config)| (name.as_str(), config))
            .ok_or_else(|| ClusterError::UnknownGroup {
                group: name.to_string(),
            })
    }

    /// The shard's pool, created on first reference
    pub fn pool(&self, group: &str, key: &str) -> Result<Arc<Pool>, ClusterError> {
        let name = pool_name(group, key);

        if let Some(pool) = self.read_pools().get(&name) {
            return Ok(Arc::clone(pool));
        }

        let shard = self
            .config
            .groups
            .get(group)
            .ok_or_else(|| ClusterError::UnknownGroup {
                group: group.to_string(),
            })?
            .shards
            .get(key)
            .ok_or_else(|| ClusterError::UnknownShard {
                group: group.to_string(),
                key: key.to_string(),
            })?;

        let mut pools = self.write_pools();
        // Another task may have created it while we waited for the lock
        if let Some(pool) = pools.get(&name) {
            return Ok(Arc::clone(pool));
        }

        let driver = self
            .drivers
            .create(shard)
            .map_err(|source| ClusterError::Driver {
                pool: name.clone(),
                source,
            })?;
        let pool = Arc::new(Pool::new(
            name.clone(),
            driver,
            self.config.pool.capacity(),
            self.config.acquire_timeout(group, key),
        ));
        pools.insert(name, Arc::clone(&pool));

        Ok(pool)
    }

    /// Check out a connection from the resolved shard's pool
    pub async fn get(&self, group: Option<&str>, key: Option<&str>) -> Result<Checkout, ClusterError> {
        let (group, key) = self.resolve(group, key)?;
        let pool = self.pool(&group, &key)?;
        let lease = pool.acquire().await?;

        Ok(Checkout { group, key, lease })
    }

    /// Hand a lease back to the pool of `group/key`.
    ///
    /// # Panics
    ///
    /// Panics if that pool does not exist or did not issue the lease.
    pub fn put(&self, group: &str, key: &str, lease: Lease) {
        let name = pool_name(group, key);
        let pool = self.read_pools().get(&name).cloned();
        match pool {
            Some(pool) => pool.release(lease),
            None => panic!("lease from pool '{}' returned to unknown pool '{}'", lease.pool_name(), name),
        }
    }

    /// Stats for every materialized pool, sorted by name
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .read_pools()
            .values()
            .map(|pool| PoolStats {
                name: pool.name().to_string(),
                driver: self.driver_name(pool.name()),
                state: pool.state(),
                metrics: pool.metrics(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn driver_name(&self, pool_name: &str) -> String {
        pool_name
            .split_once('/')
            .and_then(|(group, key)| self.config.groups.get(group)?.shards.get(key))
            .map(|shard| shard.driver.clone())
            .unwrap_or_default()
    }

    fn read_pools(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Pool>>> {
        // The map is only ever inserted into, so a poisoned lock still holds valid data
        self.pools.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_pools(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Pool>>> {
        self.pools.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut groups: Vec<&String> = self.config.groups.keys().collect();
        groups.sort();
        f.debug_struct("Cluster")
            .field("groups", &groups)
            .field("drivers", &self.drivers)
            .field("pools", &self.read_pools().len())
            .finish()
    }
}

fn pool_name(group: &str, key: &str) -> String {
    format!("{}/{}", group, key)
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Unknown group '{group}'")]
    UnknownGroup { group: String },
    #[error("Unknown shard '{key}' in group '{group}'")]
    UnknownShard { group: String, key: String },
    #[error("Shard '{group}/{key}' uses unknown driver '{driver}'")]
    UnknownDriver {
        group: String,
        key: String,
        driver: String,
    },
    #[error("Failed to build driver for pool '{pool}': {source}")]
    Driver {
        pool: String,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
}
