use super::backend::{BackendError, Connection, Driver};
use super::connection_pool::{ConnectionPoolBuilder, DriverPool, PooledDriverConnection};
use super::metrics::{MetricsSnapshot, PoolMetrics};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

/// Bounded pool of ready connections for one shard.
///
/// The pool is empty until [`Pool::fill`] runs, which opens exactly
/// `capacity` connections. After that the pool never grows or shrinks; broken
/// connections are replaced one for one.
pub struct Pool {
    name: String,
    driver: Arc<dyn Driver>,
    capacity: u32,
    timeout: Duration,
    inner: OnceCell<DriverPool>,
    metrics: Arc<PoolMetrics>,
}

impl Pool {
    pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>, capacity: u32, timeout: Duration) -> Self {
        let name = name.into();
        tracing::info!(
            "📦 Creating pool '{}' ({} driver, capacity {}, timeout {:?})",
            name,
            driver.name(),
            capacity.max(1),
            timeout
        );

        Self {
            metrics: Arc::new(PoolMetrics::new(name.clone())),
            name,
            driver,
            capacity: capacity.max(1),
            timeout,
            inner: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Configured acquire timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_filled(&self) -> bool {
        self.inner.initialized()
    }

    /// Open the pool's connections. Runs once; concurrent callers wait for the
    /// first. A failed fill leaves the pool empty so a later call can retry.
    pub async fn fill(&self) -> Result<(), PoolError> {
        self.filled().await.map(|_| ())
    }

    async fn filled(&self) -> Result<&DriverPool, PoolError> {
        self.inner
            .get_or_try_init(|| async {
                let started = Instant::now();
                let pool = ConnectionPoolBuilder::build_pool(
                    Arc::clone(&self.driver),
                    Arc::clone(&self.metrics),
                    self.capacity,
                    self.timeout,
                )
                .await
                .map_err(|source| PoolError::Connect {
                    pool: self.name.clone(),
                    source,
                })?;

                tracing::info!(
                    "✅ Pool '{}' filled with {} connections in {:?}",
                    self.name,
                    self.capacity,
                    started.elapsed()
                );
                Ok(pool)
            })
            .await
    }

    /// Acquire with the configured timeout
    pub async fn acquire(&self) -> Result<Lease, PoolError> {
        self.acquire_within(self.timeout).await
    }

    /// Wait in FIFO order for a free connection. Fails with
    /// [`PoolError::Exhausted`] once `timeout` elapses; a timed-out wait
    /// leaves the pool as it was. Waits are also capped by the configured
    /// timeout.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<Lease, PoolError> {
        let pool = self.filled().await?;
        let started = Instant::now();

        match tokio::time::timeout(timeout, pool.get_owned()).await {
            Ok(Ok(conn)) => {
                let waited = started.elapsed();
                self.metrics.record_acquire(waited);
                tracing::trace!(
                    "Pool '{}' leased {}#{} after {:?}",
                    self.name,
                    conn.backend(),
                    conn.id(),
                    waited
                );
                Ok(Lease {
                    conn,
                    metrics: Arc::clone(&self.metrics),
                })
            }
            Ok(Err(bb8::RunError::User(source))) => Err(PoolError::Connect {
                pool: self.name.clone(),
                source,
            }),
            Ok(Err(bb8::RunError::TimedOut)) | Err(_) => {
                self.metrics.record_timeout();
                let timeout = timeout.min(self.timeout);
                tracing::warn!("Pool '{}' exhausted after {:?}", self.name, timeout);
                Err(PoolError::Exhausted {
                    pool: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Return a lease to this pool.
    ///
    /// # Panics
    ///
    /// Panics if the lease was checked out from a different pool.
    pub fn release(&self, lease: Lease) {
        assert!(
            Arc::ptr_eq(&self.metrics, &lease.metrics),
            "lease from pool '{}' released into pool '{}'",
            lease.pool_name(),
            self.name
        );
        drop(lease);
    }

    pub fn state(&self) -> PoolState {
        let (connections, idle) = match self.inner.get() {
            Some(pool) => {
                let state = pool.state();
                (state.connections, state.idle_connections)
            }
            None => (0, 0),
        };

        PoolState {
            capacity: self.capacity,
            connections,
            idle,
            outstanding: connections.saturating_sub(idle),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .field("filled", &self.is_filled())
            .finish()
    }
}

/// Live/idle counts of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub capacity: u32,
    pub connections: u32,
    pub idle: u32,
    /// Connections currently checked out
    pub outstanding: u32,
}

/// A connection checked out of a [`Pool`].
///
/// Dropping a lease runs the connection's `release` hook and hands it back to
/// the pool it came from, so a lease is returned even when its task is
/// cancelled.
pub struct Lease {
    conn: PooledDriverConnection,
    metrics: Arc<PoolMetrics>,
}

impl Lease {
    /// Name of the pool this lease belongs to
    pub fn pool_name(&self) -> &str {
        self.metrics.pool_name()
    }
}

impl Deref for Lease {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.conn.release();
        self.metrics.record_release();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lease({} {}#{})", self.pool_name(), self.conn.backend(), self.conn.id())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool '{pool}' exhausted: no connection available within {timeout:?}")]
    Exhausted { pool: String, timeout: Duration },
    #[error("Pool '{pool}' could not connect: {source}")]
    Connect {
        pool: String,
        #[source]
        source: BackendError,
    },
}
