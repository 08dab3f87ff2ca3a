use super::backend::{BackendError, Connection, Value};
use super::cluster::{Cluster, ClusterError, PoolStats};
use super::drivers::DriverTable;
use super::pool::PoolError;
use super::protocols::resp::RespValue;
use super::scope::{AffinityToken, TaskScope};
use crate::config::Config;
use std::sync::Arc;

/// Group name used by [`Manager::master`]
pub const MASTER_GROUP: &str = "master";
/// Group name used by [`Manager::slave`]
pub const SLAVE_GROUP: &str = "slave";

/// Task-facing cache API.
///
/// Every call takes the caller's [`TaskScope`]. The first call for a shard
/// checks a connection out of the cluster and parks it in the scope; later
/// calls in the same scope reuse it, and the scope hands it back when it ends.
#[derive(Debug, Clone)]
pub struct Manager {
    cluster: Arc<Cluster>,
}

impl Manager {
    /// Manager with the built-in drivers
    pub fn new(config: Config) -> Result<Self, CacheError> {
        Self::with_drivers(config, DriverTable::builtin())
    }

    pub fn with_drivers(config: Config, drivers: DriverTable) -> Result<Self, CacheError> {
        let cluster = Cluster::new(config, drivers)?;
        Ok(Self {
            cluster: Arc::new(cluster),
        })
    }

    /// Load a YAML config file and build a manager with the built-in drivers
    pub async fn from_yaml_file(path: &str) -> Result<Self, CacheError> {
        let config = Config::from_yaml_file(path)
            .await
            .map_err(ClusterError::from)?;
        Self::new(config)
    }

    /// Fresh scope for one unit of work
    pub fn scope(&self) -> TaskScope {
        TaskScope::new()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.cluster.stats()
    }

    /// The scope's connection for `(group, key)`.
    ///
    /// With neither argument the scope's last shard is reused; with only a
    /// group, that group's last shard is reused. Otherwise the defaults are
    /// filled in from configuration.
    pub async fn connection<'s>(
        &self,
        scope: &'s mut TaskScope,
        key: Option<&str>,
        group: Option<&str>,
    ) -> Result<&'s mut dyn Connection, CacheError> {
        let token = self.affinity(scope, key, group)?;
        scope.remember(&token);

        if !scope.holds(&token) {
            let checkout = self
                .cluster
                .get(Some(&token.group), Some(&token.key))
                .await?;

            let cluster = Arc::clone(&self.cluster);
            let hook_token = token.clone();
            scope.attach(
                token.clone(),
                checkout.lease,
                Box::new(move |scope: &mut TaskScope| {
                    if let Some(lease) = scope.take(&hook_token) {
                        cluster.put(&hook_token.group, &hook_token.key, lease);
                    }
                }),
            );
        }

        match scope.lease_mut(&token) {
            Some(lease) => Ok(&mut **lease),
            None => Err(CacheError::NotBorrowed {
                token: token.to_string(),
            }),
        }
    }

    fn affinity(
        &self,
        scope: &TaskScope,
        key: Option<&str>,
        group: Option<&str>,
    ) -> Result<AffinityToken, CacheError> {
        if key.is_none() {
            if group.is_none() {
                if let Some(token) = scope.last() {
                    return Ok(token.clone());
                }
            }

            let group = self.cluster.resolve_group(group)?;
            if let Some(token) = scope.last_for(&group) {
                return Ok(token.clone());
            }
        }

        let (group, key) = self.cluster.resolve(group, key)?;
        Ok(AffinityToken::new(group, key))
    }

    /// Select a shard of the `master` group for the following calls
    pub async fn master(&self, scope: &mut TaskScope, key: Option<&str>) -> Result<&Self, CacheError> {
        self.connection(scope, key, Some(MASTER_GROUP)).await?;
        Ok(self)
    }

    /// Select a shard of the `slave` group for the following calls
    pub async fn slave(&self, scope: &mut TaskScope, key: Option<&str>) -> Result<&Self, CacheError> {
        self.connection(scope, key, Some(SLAVE_GROUP)).await?;
        Ok(self)
    }

    pub async fn has(&self, scope: &mut TaskScope, key: &str) -> Result<bool, CacheError> {
        Ok(self.connection(scope, None, None).await?.has(key).await?)
    }

    pub async fn get(&self, scope: &mut TaskScope, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.connection(scope, None, None).await?.get(key).await?)
    }

    pub async fn get_or(&self, scope: &mut TaskScope, key: &str, default: Value) -> Result<Value, CacheError> {
        Ok(self
            .connection(scope, None, None)
            .await?
            .get_or(key, default)
            .await?)
    }

    pub async fn set(
        &self,
        scope: &mut TaskScope,
        key: &str,
        value: &Value,
        ttl: Option<u64>,
    ) -> Result<bool, CacheError> {
        Ok(self
            .connection(scope, None, None)
            .await?
            .set(key, value, ttl)
            .await?)
    }

    pub async fn incr(&self, scope: &mut TaskScope, key: &str, step: i64) -> Result<i64, CacheError> {
        Ok(self.connection(scope, None, None).await?.incr(key, step).await?)
    }

    pub async fn decr(&self, scope: &mut TaskScope, key: &str, step: i64) -> Result<i64, CacheError> {
        Ok(self.connection(scope, None, None).await?.decr(key, step).await?)
    }

    pub async fn delete(&self, scope: &mut TaskScope, key: &str) -> Result<bool, CacheError> {
        Ok(self.connection(scope, None, None).await?.delete(key).await?)
    }

    pub async fn clear(&self, scope: &mut TaskScope) -> Result<bool, CacheError> {
        Ok(self.connection(scope, None, None).await?.clear().await?)
    }

    /// Forward a backend-native command
    pub async fn command(
        &self,
        scope: &mut TaskScope,
        name: &str,
        args: &[Vec<u8>],
    ) -> Result<RespValue, CacheError> {
        Ok(self
            .connection(scope, None, None)
            .await?
            .command(name, args)
            .await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("No connection borrowed for '{token}'")]
    NotBorrowed { token: String },
}

impl CacheError {
    /// No connection became free within the acquire timeout
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            CacheError::Cluster(ClusterError::Pool(PoolError::Exhausted { .. }))
        )
    }

    /// Transient failures a caller may retry later
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Cluster(ClusterError::Pool(_)) => true,
            CacheError::Backend(
                BackendError::ConnectionFailed(_) | BackendError::Io(_) | BackendError::Protocol(_),
            ) => true,
            _ => false,
        }
    }
}
