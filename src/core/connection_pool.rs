use crate::core::backend::{BackendError, Connection, Driver};
use crate::core::metrics::PoolMetrics;
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use std::sync::Arc;
use std::time::Duration;

/// Connection manager for bb8 that opens connections through a shard's driver
pub struct DriverConnectionManager {
    driver: Arc<dyn Driver>,
    metrics: Arc<PoolMetrics>,
}

impl DriverConnectionManager {
    pub fn new(driver: Arc<dyn Driver>, metrics: Arc<PoolMetrics>) -> Self {
        Self { driver, metrics }
    }
}

#[async_trait]
impl bb8::ManageConnection for DriverConnectionManager {
    type Connection = Box<dyn Connection>;
    type Error = BackendError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.metrics.record_connection_attempt();

        match self.driver.connect(true).await {
            Ok(conn) => {
                self.metrics.record_connection_success();
                tracing::debug!(
                    "🔌 Opened {}#{} for pool '{}'",
                    conn.backend(),
                    conn.id(),
                    self.metrics.pool_name()
                );
                Ok(conn)
            }
            Err(e) => {
                self.metrics.record_connection_failure();
                tracing::warn!(
                    "Pool '{}' failed to open a {} connection: {}",
                    self.metrics.pool_name(),
                    self.driver.name(),
                    e
                );
                Err(e)
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.ping().await
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        if conn.is_broken() {
            tracing::info!(
                "Discarding broken {}#{} from pool '{}'",
                conn.backend(),
                conn.id(),
                self.metrics.pool_name()
            );
            return true;
        }
        false
    }
}

/// Type alias for a shard's bb8 pool
pub type DriverPool = Pool<DriverConnectionManager>;

/// A checked-out bb8 connection that owns its pool handle
pub type PooledDriverConnection = PooledConnection<'static, DriverConnectionManager>;

/// Builder for fixed-size shard pools
pub struct ConnectionPoolBuilder;

impl ConnectionPoolBuilder {
    /// Build a pool holding exactly `capacity` connections. bb8 opens them all
    /// before returning; any connect failure fails the build.
    pub async fn build_pool(
        driver: Arc<dyn Driver>,
        metrics: Arc<PoolMetrics>,
        capacity: u32,
        acquire_timeout: Duration,
    ) -> Result<DriverPool, BackendError> {
        let capacity = capacity.max(1);
        let manager = DriverConnectionManager::new(driver, metrics);

        Pool::builder()
            .max_size(capacity)
            .min_idle(Some(capacity))
            // bb8 rejects a zero timeout
            .connection_timeout(acquire_timeout.max(Duration::from_millis(1)))
            .idle_timeout(None)
            .max_lifetime(None)
            .retry_connection(false)
            .test_on_check_out(false)
            .build(manager)
            .await
    }
}
