pub mod file;
pub mod remote;

pub use file::{FileConfig, FileDriver, SerializeFormat};
pub use remote::{RemoteConfig, RemoteDriver};

use crate::config::ShardConfig;
use crate::core::backend::{BackendError, Driver};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds a driver from a shard's configuration
pub type DriverFactory =
    Arc<dyn Fn(&ShardConfig) -> Result<Arc<dyn Driver>, BackendError> + Send + Sync>;

/// Driver type name -> factory. Shards name their driver with `type:`.
#[derive(Clone, Default)]
pub struct DriverTable {
    factories: HashMap<String, DriverFactory>,
}

impl DriverTable {
    /// Empty table, for callers that register everything themselves
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in `file` and `remote` drivers
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register("file", |shard| {
            Ok(Arc::new(FileDriver::from_shard(shard)?) as Arc<dyn Driver>)
        });
        table.register("remote", |shard| {
            Ok(Arc::new(RemoteDriver::from_shard(shard)?) as Arc<dyn Driver>)
        });
        table
    }

    /// Register (or replace) a driver type
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&ShardConfig) -> Result<Arc<dyn Driver>, BackendError> + Send + Sync + 'static,
    {
        if self
            .factories
            .insert(name.to_string(), Arc::new(factory))
            .is_some()
        {
            tracing::debug!("Replacing driver '{}'", name);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered driver names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the driver a shard asks for
    pub fn create(&self, shard: &ShardConfig) -> Result<Arc<dyn Driver>, BackendError> {
        let factory = self.factories.get(&shard.driver).ok_or_else(|| {
            BackendError::InvalidConfig(format!("unknown driver type '{}'", shard.driver))
        })?;
        factory(shard)
    }
}

impl fmt::Debug for DriverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverTable")
            .field("drivers", &self.names())
            .finish()
    }
}
