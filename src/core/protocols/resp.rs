//! RESP2 framing for the remote driver: command encoding and async reply parsing.

use crate::core::backend::BackendError;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest bulk string accepted from a server (512 MiB)
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest array accepted from a server
pub const MAX_ARRAY_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on preallocated array slots
const ARRAY_PREALLOC: usize = 1024;

/// RESP reply value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK / +PONG
    Simple(Vec<u8>),
    /// -ERR ...
    Error(Vec<u8>),
    /// :123
    Integer(i64),
    /// $n bulk string, None for the null bulk string
    Bulk(Option<Vec<u8>>),
    /// *n array
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Error message of an error reply
    pub fn error_message(&self) -> Option<String> {
        match self {
            RespValue::Error(message) => Some(String::from_utf8_lossy(message).into_owned()),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(s) if s.as_slice() == b"OK")
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Read one reply. Arrays recurse, so the future is boxed.
pub fn read_response<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<RespValue, BackendError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    async move {
        let line = read_line(reader).await?;
        let (kind, rest) = line
            .split_first()
            .ok_or_else(|| BackendError::Protocol("empty reply line".to_string()))?;

        match kind {
            b'+' => Ok(RespValue::Simple(rest.to_vec())),
            b'-' => Ok(RespValue::Error(rest.to_vec())),
            b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
            b'$' => {
                let Some(len) = parse_len(rest, MAX_BULK_LEN, "bulk string")? else {
                    return Ok(RespValue::Bulk(None));
                };
                let framed = len
                    .checked_add(2)
                    .ok_or_else(|| BackendError::Protocol(format!("bulk length {} overflows", len)))?;
                let mut data = vec![0u8; framed];
                reader.read_exact(&mut data).await?;
                if !data.ends_with(b"\r\n") {
                    return Err(BackendError::Protocol("bulk string not CRLF terminated".to_string()));
                }
                data.truncate(len);
                Ok(RespValue::Bulk(Some(data)))
            }
            b'*' => {
                let len = parse_len(rest, MAX_ARRAY_LEN, "array")?.unwrap_or(0);
                let mut items = Vec::with_capacity(len.min(ARRAY_PREALLOC));
                for _ in 0..len {
                    items.push(read_response(reader).await?);
                }
                Ok(RespValue::Array(items))
            }
            other => Err(BackendError::Protocol(format!(
                "unexpected reply type byte 0x{:02x}",
                other
            ))),
        }
    }
    .boxed()
}

async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, BackendError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(BackendError::Protocol("connection closed by server".to_string()));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(BackendError::Protocol("reply line not CRLF terminated".to_string()));
    }
    buf.truncate(buf.len() - 2);
    Ok(buf)
}

/// Length header of a bulk string or array. Negative lengths are null replies.
fn parse_len(data: &[u8], max: usize, what: &str) -> Result<Option<usize>, BackendError> {
    let len = parse_i64(data)?;
    if len < 0 {
        return Ok(None);
    }
    match usize::try_from(len) {
        Ok(len) if len <= max => Ok(Some(len)),
        _ => Err(BackendError::Protocol(format!(
            "{} length {} exceeds limit of {}",
            what, len, max
        ))),
    }
}

fn parse_i64(data: &[u8]) -> Result<i64, BackendError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            BackendError::Protocol(format!(
                "invalid integer '{}'",
                String::from_utf8_lossy(data)
            ))
        })
}
