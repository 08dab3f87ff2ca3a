use crate::core::protocols::resp::RespValue;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Values stored through any backend
pub type Value = serde_json::Value;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a freshly opened connection (used in logs)
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Core trait for an open cache connection (one pool slot)
#[async_trait]
pub trait Connection: Send + Sync {
    /// Backend type name ("file", "remote", ...)
    fn backend(&self) -> &str;

    /// Process-unique connection id
    fn id(&self) -> u64;

    /// Cleanup run before the connection goes back to its pool
    fn release(&mut self) {}

    /// True once the connection can no longer be used; the pool discards it
    fn is_broken(&self) -> bool {
        false
    }

    /// Liveness probe
    async fn ping(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn has(&mut self, key: &str) -> Result<bool, BackendError>;

    async fn get(&mut self, key: &str) -> Result<Option<Value>, BackendError>;

    /// `get` with a caller-supplied fallback for missing or expired keys
    async fn get_or(&mut self, key: &str, default: Value) -> Result<Value, BackendError> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Store a value. `None` or `Some(0)` uses the backend's configured expiry.
    /// A ttl the backend cannot represent is an error, never truncated.
    async fn set(&mut self, key: &str, value: &Value, ttl: Option<u64>) -> Result<bool, BackendError>;

    /// Add `step` to a numeric value, treating a missing key as 0
    async fn incr(&mut self, key: &str, step: i64) -> Result<i64, BackendError>;

    async fn decr(&mut self, key: &str, step: i64) -> Result<i64, BackendError> {
        let step = step
            .checked_neg()
            .ok_or_else(|| BackendError::Overflow { key: key.to_string() })?;
        self.incr(key, step).await
    }

    async fn delete(&mut self, key: &str) -> Result<bool, BackendError>;

    async fn clear(&mut self) -> Result<bool, BackendError>;

    /// Forward a backend-native command. Backends reject commands they do not know.
    async fn command(&mut self, name: &str, _args: &[Vec<u8>]) -> Result<RespValue, BackendError> {
        Err(BackendError::Unsupported {
            backend: self.backend().to_string(),
            command: name.to_string(),
        })
    }
}

/// Builds connections for one shard
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver type name
    fn name(&self) -> &str;

    /// Single connection attempt
    async fn open(&self) -> Result<Box<dyn Connection>, BackendError>;

    /// Open a connection, retrying once (with reconnect disabled) when `reconnect` is set
    async fn connect(&self, mut reconnect: bool) -> Result<Box<dyn Connection>, BackendError> {
        loop {
            match self.open().await {
                Ok(conn) => return Ok(conn),
                Err(e) if reconnect => {
                    tracing::warn!("{} driver: connect failed ({}), retrying once", self.name(), e);
                    reconnect = false;
                }
                Err(e) => {
                    return Err(match e {
                        BackendError::ConnectionFailed(_) => e,
                        other => BackendError::ConnectionFailed(other.to_string()),
                    })
                }
            }
        }
    }
}

/// Coerce a stored value into a counter; numeric strings count as numbers
pub fn counter_value(key: &str, value: &Value) -> Result<i64, BackendError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| BackendError::NotNumeric { key: key.to_string() })
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Value at '{key}' is not an integer")]
    NotNumeric { key: String },
    #[error("Counter at '{key}' would overflow")]
    Overflow { key: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Backend '{backend}' does not support command '{command}'")]
    Unsupported { backend: String, command: String },
    #[error("Invalid driver configuration: {0}")]
    InvalidConfig(String),
}
