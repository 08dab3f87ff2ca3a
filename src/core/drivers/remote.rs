use crate::config::ShardConfig;
use crate::core::backend::{next_connection_id, BackendError, Connection, Driver, Value};
use crate::core::protocols::resp::{encode_command, read_response, RespValue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Commands accepted by the raw `command` escape hatch
const SUPPORTED_COMMANDS: &[&str] = &[
    "APPEND", "DBSIZE", "DECR", "DECRBY", "DEL", "ECHO", "EXISTS", "EXPIRE", "GET", "GETSET",
    "HDEL", "HEXISTS", "HGET", "HGETALL", "HINCRBY", "HKEYS", "HLEN", "HMGET", "HSET", "INCR",
    "INCRBY", "KEYS", "LLEN", "LPOP", "LPUSH", "LRANGE", "MGET", "MSET", "PERSIST", "PEXPIRE",
    "PING", "PTTL", "RPOP", "RPUSH", "SADD", "SCARD", "SET", "SETEX", "SETNX", "SISMEMBER",
    "SMEMBERS", "SREM", "STRLEN", "TTL", "TYPE", "ZADD", "ZCARD", "ZRANGE", "ZREM", "ZSCORE",
];

/// Options understood by the remote driver
const KNOWN_OPTIONS: &[&str] = &["prefix"];

/// Remote key-value driver options, merged over the defaults below
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Default expiry in seconds, 0 = never
    pub expire: u64,
    /// Database index selected after connecting
    pub select: u32,
    pub password: String,
    /// Connect timeout in (fractional) seconds
    pub timeout: f64,
    pub options: HashMap<String, serde_yaml::Value>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            expire: 0,
            select: 0,
            password: String::new(),
            timeout: 2.0,
            options: HashMap::new(),
        }
    }
}

impl RemoteConfig {
    pub fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Key prefix from `options.prefix`
    pub fn prefix(&self) -> &str {
        self.options
            .get("prefix")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or("")
    }
}

/// Optimize TCP socket for low latency
fn optimize_socket_for_latency(stream: &TcpStream) {
    // Disable Nagle's algorithm for lower latency
    let _ = stream.set_nodelay(true);

    let socket_ref = socket2::SockRef::from(stream);
    let _ = socket_ref.set_reuse_address(true);

    // 32KB buffers balance latency vs throughput for cache operations
    let _ = socket_ref.set_send_buffer_size(32768);
    let _ = socket_ref.set_recv_buffer_size(32768);
}

/// Driver for a RESP2 key-value server
#[derive(Debug)]
pub struct RemoteDriver {
    config: Arc<RemoteConfig>,
}

impl RemoteDriver {
    pub fn new(config: RemoteConfig) -> Result<Self, BackendError> {
        if !config.timeout.is_finite() || config.timeout <= 0.0 {
            return Err(BackendError::InvalidConfig(format!(
                "remote connect timeout must be positive, got {}",
                config.timeout
            )));
        }
        for name in config.options.keys() {
            if !KNOWN_OPTIONS.contains(&name.as_str()) {
                tracing::warn!("remote driver: ignoring unknown option '{}'", name);
            }
        }

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_shard(shard: &ShardConfig) -> Result<Self, BackendError> {
        let config: RemoteConfig = shard
            .driver_options()
            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?;
        Self::new(config)
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }
}

#[async_trait]
impl Driver for RemoteDriver {
    fn name(&self) -> &str {
        "remote"
    }

    async fn open(&self) -> Result<Box<dyn Connection>, BackendError> {
        let server = self.config.server();
        let connect_timeout = Duration::from_secs_f64(self.config.timeout);

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&server))
            .await
            .map_err(|_| {
                BackendError::ConnectionFailed(format!(
                    "Connection to {} timed out after {:?}",
                    server, connect_timeout
                ))
            })?
            .map_err(|e| BackendError::ConnectionFailed(format!("{}: {}", server, e)))?;

        optimize_socket_for_latency(&stream);

        let mut conn = RemoteConnection {
            id: next_connection_id(),
            reader: BufReader::new(stream),
            config: Arc::clone(&self.config),
            broken: false,
        };

        if !self.config.password.is_empty() {
            conn.expect_ok(&[b"AUTH", self.config.password.as_bytes()]).await?;
        }
        let db = self.config.select.to_string();
        conn.expect_ok(&[b"SELECT", db.as_bytes()]).await?;

        tracing::debug!("remote#{} connected to {} (db {})", conn.id, server, db);
        Ok(Box::new(conn))
    }
}

pub struct RemoteConnection {
    id: u64,
    reader: BufReader<TcpStream>,
    config: Arc<RemoteConfig>,
    broken: bool,
}

impl RemoteConnection {
    fn key(&self, key: &str) -> Vec<u8> {
        let prefix = self.config.prefix();
        let mut full = Vec::with_capacity(prefix.len() + key.len());
        full.extend_from_slice(prefix.as_bytes());
        full.extend_from_slice(key.as_bytes());
        full
    }

    /// Send one command and read its reply. I/O and framing failures mark the
    /// connection broken so the pool replaces it.
    ///
    /// The connection counts as broken while a request is in flight. A caller
    /// dropped between the write and the reply leaves an unread reply on the
    /// socket, and the flag keeps that socket out of the pool.
    async fn exec(&mut self, args: &[&[u8]]) -> Result<RespValue, BackendError> {
        let mut request = Vec::new();
        encode_command(args, &mut request);

        self.broken = true;
        let result = self.roundtrip(&request).await;
        match &result {
            Ok(_) => self.broken = false,
            Err(e) => tracing::warn!("remote#{}: marking connection broken: {}", self.id, e),
        }
        result
    }

    async fn roundtrip(&mut self, request: &[u8]) -> Result<RespValue, BackendError> {
        let stream = self.reader.get_mut();
        stream.write_all(request).await?;
        stream.flush().await?;
        read_response(&mut self.reader).await
    }

    async fn expect_ok(&mut self, args: &[&[u8]]) -> Result<(), BackendError> {
        match self.exec(args).await? {
            reply if reply.is_ok() => Ok(()),
            reply => Err(unexpected(reply)),
        }
    }

    async fn counter(&mut self, verb: &[u8], key: &str, step: i64) -> Result<i64, BackendError> {
        let full_key = self.key(key);
        let step = step.to_string();
        match self.exec(&[verb, &full_key, step.as_bytes()]).await? {
            RespValue::Integer(value) => Ok(value),
            RespValue::Error(message) => {
                let message = String::from_utf8_lossy(&message).into_owned();
                if message.contains("not an integer") {
                    Err(BackendError::NotNumeric { key: key.to_string() })
                } else if message.contains("overflow") {
                    Err(BackendError::Overflow { key: key.to_string() })
                } else {
                    Err(BackendError::Server(message))
                }
            }
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: RespValue) -> BackendError {
    match reply.error_message() {
        Some(message) => BackendError::Server(message),
        None => BackendError::Protocol(format!("unexpected reply {:?}", reply)),
    }
}

fn decode_value(bytes: Vec<u8>) -> Value {
    serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}

#[async_trait]
impl Connection for RemoteConnection {
    fn backend(&self) -> &str {
        "remote"
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        match self.exec(&[b"PING"]).await? {
            RespValue::Simple(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn has(&mut self, key: &str) -> Result<bool, BackendError> {
        let key = self.key(key);
        match self.exec(&[b"EXISTS", &key]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            other => Err(unexpected(other)),
        }
    }

    async fn get(&mut self, key: &str) -> Result<Option<Value>, BackendError> {
        let key = self.key(key);
        match self.exec(&[b"GET", &key]).await? {
            RespValue::Bulk(Some(bytes)) => Ok(Some(decode_value(bytes))),
            RespValue::Bulk(None) => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&mut self, key: &str, value: &Value, ttl: Option<u64>) -> Result<bool, BackendError> {
        let key = self.key(key);
        let payload =
            serde_json::to_vec(value).map_err(|e| BackendError::Serialization(e.to_string()))?;
        let expire = match ttl {
            Some(ttl) if ttl > 0 => ttl,
            _ => self.config.expire,
        };

        let reply = if expire == 0 {
            self.exec(&[b"SET", &key, &payload]).await?
        } else {
            let seconds = expire.to_string();
            self.exec(&[b"SETEX", &key, seconds.as_bytes(), &payload]).await?
        };

        match reply {
            RespValue::Error(_) => Err(unexpected(reply)),
            reply => Ok(reply.is_ok()),
        }
    }

    async fn incr(&mut self, key: &str, step: i64) -> Result<i64, BackendError> {
        self.counter(b"INCRBY", key, step).await
    }

    async fn decr(&mut self, key: &str, step: i64) -> Result<i64, BackendError> {
        self.counter(b"DECRBY", key, step).await
    }

    async fn delete(&mut self, key: &str) -> Result<bool, BackendError> {
        let key = self.key(key);
        match self.exec(&[b"DEL", &key]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            other => Err(unexpected(other)),
        }
    }

    async fn clear(&mut self) -> Result<bool, BackendError> {
        match self.exec(&[b"FLUSHDB"]).await? {
            reply if reply.is_ok() => Ok(true),
            other => Err(unexpected(other)),
        }
    }

    async fn command(&mut self, name: &str, args: &[Vec<u8>]) -> Result<RespValue, BackendError> {
        let verb = name.to_ascii_uppercase();
        if !SUPPORTED_COMMANDS.contains(&verb.as_str()) {
            return Err(BackendError::Unsupported {
                backend: self.backend().to_string(),
                command: name.to_string(),
            });
        }

        let mut parts: Vec<&[u8]> = Vec::with_capacity(args.len() + 1);
        parts.push(verb.as_bytes());
        parts.extend(args.iter().map(Vec::as_slice));

        match self.exec(&parts).await? {
            RespValue::Error(message) => {
                Err(BackendError::Server(String::from_utf8_lossy(&message).into_owned()))
            }
            reply => Ok(reply),
        }
    }
}
