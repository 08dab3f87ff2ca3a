use crate::config::ShardConfig;
use crate::core::backend::{counter_value, next_connection_id, BackendError, Connection, Driver, Value};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Every record starts with a fixed 32-byte header
pub const HEADER_LEN: usize = 32;
/// Offset of the 12-digit, zero-padded expire field inside the header
pub const EXPIRE_OFFSET: usize = 8;
const EXPIRE_DIGITS: usize = 12;
/// Longest expiry the 12-digit header field can hold
pub const MAX_EXPIRE: u64 = 999_999_999_999;

/// Deepest directory level `clear` will descend to
const MAX_CLEAR_DEPTH: usize = 8;

const COMPRESSION_LEVEL: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializeFormat {
    /// YAML document
    #[default]
    #[serde(alias = "serialize")]
    Default,
    Json,
    /// Base64 of the value's string form
    Base64,
}

impl SerializeFormat {
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, BackendError> {
        match self {
            SerializeFormat::Default => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| BackendError::Serialization(e.to_string())),
            SerializeFormat::Json => {
                serde_json::to_vec(value).map_err(|e| BackendError::Serialization(e.to_string()))
            }
            SerializeFormat::Base64 => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok(BASE64.encode(text.as_bytes()).into_bytes())
            }
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Value, BackendError> {
        match self {
            SerializeFormat::Default => {
                serde_yaml::from_slice(data).map_err(|e| BackendError::Serialization(e.to_string()))
            }
            SerializeFormat::Json => {
                serde_json::from_slice(data).map_err(|e| BackendError::Serialization(e.to_string()))
            }
            SerializeFormat::Base64 => {
                let bytes = BASE64
                    .decode(data)
                    .map_err(|e| BackendError::Serialization(e.to_string()))?;
                String::from_utf8(bytes)
                    .map(Value::String)
                    .map_err(|e| BackendError::Serialization(e.to_string()))
            }
        }
    }
}

/// File driver options, merged over the defaults below
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    pub path: PathBuf,
    pub prefix: String,
    /// Default expiry in seconds, 0 = never
    pub expire: u64,
    pub serialize: SerializeFormat,
    #[serde(alias = "data_compress")]
    pub compress: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("mimir"),
            prefix: String::new(),
            expire: 0,
            serialize: SerializeFormat::Default,
            compress: false,
        }
    }
}

impl FileConfig {
    /// Directory holding this store's records
    pub fn root(&self) -> PathBuf {
        if self.prefix.is_empty() {
            self.path.clone()
        } else {
            self.path.join(&self.prefix)
        }
    }
}

/// Hashed-path file store
#[derive(Debug)]
pub struct FileDriver {
    config: Arc<FileConfig>,
}

impl FileDriver {
    pub fn new(config: FileConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn from_shard(shard: &ShardConfig) -> Result<Self, BackendError> {
        let config: FileConfig = shard
            .driver_options()
            .map_err(|e| BackendError::InvalidConfig(e.to_string()))?;
        if config.expire > MAX_EXPIRE {
            return Err(BackendError::InvalidConfig(format!(
                "file expire {} exceeds the maximum of {} seconds",
                config.expire, MAX_EXPIRE
            )));
        }
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }
}

#[async_trait]
impl Driver for FileDriver {
    fn name(&self) -> &str {
        "file"
    }

    async fn open(&self) -> Result<Box<dyn Connection>, BackendError> {
        let root = self.config.root();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            BackendError::ConnectionFailed(format!(
                "cannot create cache directory {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Box::new(FileConnection {
            id: next_connection_id(),
            config: Arc::clone(&self.config),
            root,
        }))
    }
}

struct Record {
    payload: Vec<u8>,
    expire: u64,
}

pub struct FileConnection {
    id: u64,
    config: Arc<FileConfig>,
    root: PathBuf,
}

impl FileConnection {
    /// Record location: `<root>/<md5[0..2]>/<md5[2..]>.cache`
    pub fn cache_path(&self, key: &str) -> PathBuf {
        let digest = format!("{:x}", md5::compute(key.as_bytes()));
        self.root
            .join(&digest[..2])
            .join(format!("{}.cache", &digest[2..]))
    }

    async fn read_record(&self, key: &str) -> Result<Option<Record>, BackendError> {
        let path = self.cache_path(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let expire = parse_header(&data)?;
        if expire != 0 {
            let modified = tokio::fs::metadata(&path).await?.modified()?;
            if SystemTime::now() > modified + Duration::from_secs(expire) {
                tracing::debug!("file cache: record for '{}' expired", key);
                remove_file_if_exists(&path).await?;
                return Ok(None);
            }
        }

        let mut payload = data[HEADER_LEN..].to_vec();
        if self.config.compress {
            let mut inflated = Vec::new();
            ZlibDecoder::new(payload.as_slice())
                .read_to_end(&mut inflated)
                .map_err(|e| BackendError::Serialization(format!("inflate failed: {}", e)))?;
            payload = inflated;
        }

        Ok(Some(Record { payload, expire }))
    }

    /// Records are written to a sibling temp file and renamed into place, so
    /// readers on other connections see either the old record or the new one.
    async fn write_record(&self, key: &str, value: &Value, expire: u64) -> Result<(), BackendError> {
        if expire > MAX_EXPIRE {
            return Err(BackendError::Serialization(format!(
                "expire {} for '{}' exceeds the maximum of {} seconds",
                expire, key, MAX_EXPIRE
            )));
        }
        let path = self.cache_path(key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut payload = self.config.serialize.encode(value)?;
        if self.config.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
            encoder.write_all(&payload)?;
            payload = encoder.finish()?;
        }

        let mut record = encode_header(expire);
        record.extend_from_slice(&payload);

        let mut staging = path.clone().into_os_string();
        staging.push(format!(".{}.{}.tmp", std::process::id(), self.id));
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, record).await?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            remove_file_if_exists(&staging).await?;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for FileConnection {
    fn backend(&self) -> &str {
        "file"
    }

    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        tokio::fs::metadata(&self.root).await?;
        Ok(())
    }

    async fn has(&mut self, key: &str) -> Result<bool, BackendError> {
        Ok(self.read_record(key).await?.is_some())
    }

    async fn get(&mut self, key: &str) -> Result<Option<Value>, BackendError> {
        match self.read_record(key).await? {
            Some(record) => Ok(Some(self.config.serialize.decode(&record.payload)?)),
            None => Ok(None),
        }
    }

    async fn set(&mut self, key: &str, value: &Value, ttl: Option<u64>) -> Result<bool, BackendError> {
        let expire = match ttl {
            Some(ttl) if ttl > 0 => ttl,
            _ => self.config.expire,
        };
        self.write_record(key, value, expire).await?;
        Ok(true)
    }

    async fn incr(&mut self, key: &str, step: i64) -> Result<i64, BackendError> {
        let (value, expire) = match self.read_record(key).await? {
            Some(record) => {
                let current = counter_value(key, &self.config.serialize.decode(&record.payload)?)?;
                let next = current
                    .checked_add(step)
                    .ok_or_else(|| BackendError::Overflow { key: key.to_string() })?;
                (next, record.expire)
            }
            None => (step, 0),
        };

        self.write_record(key, &Value::from(value), expire).await?;
        Ok(value)
    }

    async fn delete(&mut self, key: &str) -> Result<bool, BackendError> {
        remove_file_if_exists(&self.cache_path(key)).await
    }

    async fn clear(&mut self) -> Result<bool, BackendError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        // Only the two-hex-digit shard directories belong to this store
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_shard = name
                .to_str()
                .map(|n| n.len() == 2 && n.chars().all(|c| c.is_ascii_hexdigit()))
                .unwrap_or(false);
            if !is_shard {
                continue;
            }

            if entry.file_type().await?.is_dir() {
                remove_tree(&entry.path()).await?;
            } else {
                remove_file_if_exists(&entry.path()).await?;
            }
        }

        Ok(true)
    }
}

fn encode_header(expire: u64) -> Vec<u8> {
    let header = format!("#mimir\n#{:012}\n{:10}\n", expire, "");
    debug_assert_eq!(header.len(), HEADER_LEN);
    header.into_bytes()
}

fn parse_header(data: &[u8]) -> Result<u64, BackendError> {
    if data.len() < HEADER_LEN {
        return Err(BackendError::Serialization(format!(
            "cache record shorter than its {}-byte header",
            HEADER_LEN
        )));
    }
    let digits = &data[EXPIRE_OFFSET..EXPIRE_OFFSET + EXPIRE_DIGITS];
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| BackendError::Serialization("corrupt expire field in cache header".to_string()))
}

async fn remove_file_if_exists(path: &Path) -> Result<bool, BackendError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Depth-bounded removal of a directory tree. Symbolic links are unlinked,
/// never followed.
async fn remove_tree(dir: &Path) -> Result<(), BackendError> {
    let mut pending = vec![(dir.to_path_buf(), 0usize)];
    let mut visited = Vec::new();

    while let Some((current, depth)) = pending.pop() {
        if depth > MAX_CLEAR_DEPTH {
            tracing::warn!("file cache: not descending into {} (too deep)", current.display());
            continue;
        }

        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), depth + 1));
            } else {
                remove_file_if_exists(&entry.path()).await?;
            }
        }
        visited.push(current);
    }

    // Children were pushed after their parents
    for dir in visited.into_iter().rev() {
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("file cache: could not remove {}: {}", dir.display(), e),
        }
    }

    Ok(())
}
