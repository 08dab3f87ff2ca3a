pub mod backend;
pub mod cluster;
pub mod connection_pool;
pub mod drivers;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod protocols;
pub mod scope;

// Re-export core types
pub use backend::{BackendError, Connection, Driver, Value};
pub use cluster::{Checkout, Cluster, ClusterError, PoolStats};
pub use connection_pool::{ConnectionPoolBuilder, DriverConnectionManager, DriverPool};
pub use drivers::{DriverFactory, DriverTable, FileConfig, FileDriver, RemoteConfig, RemoteDriver};
pub use manager::{CacheError, Manager};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use pool::{Lease, Pool, PoolError, PoolState};
pub use protocols::RespValue;
pub use scope::{AffinityToken, TaskScope};
