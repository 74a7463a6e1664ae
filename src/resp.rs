//! Redis Serialization Protocol (RESP) codec for the control socket.
//!
//! Requests are RESP arrays of strings; replies are the usual simple
//! string / error / integer / bulk string / array shapes. See
//! <http://redis.io/topics/protocol> for the reference.

use std::io;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Cap on bulk string and array lengths (512MB, the Redis limit).
const MAX_LENGTH: i64 = 512 << 20;

#[derive(Error, Debug)]
pub enum RespError {
    #[error("resp: invalid prefix {0:?}")]
    InvalidPrefix(char),
    #[error("resp: missing CRLF")]
    MissingCrlf,
    #[error("resp: invalid integer character")]
    InvalidInteger,
    #[error("resp: invalid bulk string")]
    InvalidBulkString,
    #[error("resp: invalid array")]
    InvalidArray,
    #[error("resp: expected an array type")]
    NotAnArray,
    #[error("resp: invalid request, must be an array of strings with at least one element")]
    InvalidRequest,
    #[error("resp: value is not valid utf-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A decoded RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<String>),
    Array(Option<Vec<Value>>),
}

/// Decodes RESP values from a stream.
pub struct Decoder<R> {
    r: BufReader<R>,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(r: R) -> Self {
        Self {
            r: BufReader::new(r),
        }
    }

    /// Decodes one request: an array of at least one string. Simple and
    /// bulk strings both qualify; anything else is an invalid request.
    pub async fn decode_request(&mut self) -> Result<Vec<String>, RespError> {
        let items = match self.decode_value(true).await? {
            Value::Array(Some(items)) => items,
            Value::Array(None) => return Err(RespError::InvalidRequest),
            _ => return Err(RespError::NotAnArray),
        };
        if items.is_empty() {
            return Err(RespError::InvalidRequest);
        }

        let mut strs = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Simple(s) | Value::Bulk(Some(s)) => strs.push(s),
                _ => return Err(RespError::InvalidRequest),
            }
        }
        Ok(strs)
    }

    /// Decodes one value of any kind.
    pub async fn decode(&mut self) -> Result<Value, RespError> {
        self.decode_value(false).await
    }

    async fn decode_value(&mut self, requires_array: bool) -> Result<Value, RespError> {
        let prefix = self.r.read_u8().await?;
        if requires_array && prefix != b'*' {
            return Err(RespError::NotAnArray);
        }

        match prefix {
            b'+' => Ok(Value::Simple(self.read_line().await?)),
            b'-' => Ok(Value::Error(self.read_line().await?)),
            b':' => Ok(Value::Int(self.read_integer().await?)),
            b'$' => self.decode_bulk().await,
            b'*' => self.decode_array().await,
            other => Err(RespError::InvalidPrefix(other as char)),
        }
    }

    async fn decode_array(&mut self) -> Result<Value, RespError> {
        let count = self.read_integer().await?;
        match count {
            -1 => Ok(Value::Array(None)),
            0 => Ok(Value::Array(Some(Vec::new()))),
            count if !(0..=MAX_LENGTH).contains(&count) => Err(RespError::InvalidArray),
            count => {
                let mut items = Vec::with_capacity(count.min(64) as usize);
                for _ in 0..count {
                    let item = Box::pin(self.decode_value(false)).await?;
                    items.push(item);
                }
                Ok(Value::Array(Some(items)))
            }
        }
    }

    async fn decode_bulk(&mut self) -> Result<Value, RespError> {
        let count = self.read_integer().await?;
        match count {
            -1 => Ok(Value::Bulk(None)),
            count if !(0..=MAX_LENGTH).contains(&count) => Err(RespError::InvalidBulkString),
            count => {
                // the string plus its trailing CRLF
                let mut buf = vec![0u8; count as usize + 2];
                self.r.read_exact(&mut buf).await?;
                buf.truncate(count as usize);
                String::from_utf8(buf)
                    .map(|s| Value::Bulk(Some(s)))
                    .map_err(|_| RespError::InvalidUtf8)
            }
        }
    }

    async fn read_integer(&mut self) -> Result<i64, RespError> {
        let mut val: i64 = 0;
        let mut sign: i64 = 1;
        let mut n = 0;
        let mut cr = false;

        loop {
            let ch = self.r.read_u8().await?;
            n += 1;
            match ch {
                b'\r' => {
                    cr = true;
                    break;
                }
                b'\n' => break,
                b'0'..=b'9' => val = val * 10 + i64::from(ch - b'0'),
                b'-' if n == 1 => sign = -1,
                _ => return Err(RespError::InvalidInteger),
            }
        }

        if !cr {
            return Err(RespError::MissingCrlf);
        }
        // consume the \n that follows the \r
        self.r.read_u8().await?;
        Ok(sign * val)
    }

    async fn read_line(&mut self) -> Result<String, RespError> {
        let mut buf = Vec::new();
        loop {
            let ch = self.r.read_u8().await?;
            if ch == b'\r' {
                break;
            }
            buf.push(ch);
        }
        // consume the \n that follows the \r
        self.r.read_u8().await?;
        String::from_utf8(buf).map_err(|_| RespError::InvalidUtf8)
    }
}

/// A reply to encode: the daemon's whole reply surface. `Ok` and `Pong`
/// exist as their own variants so command code reads like the protocol it
/// speaks; booleans go out as the integers 1 and 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Pong,
    Error(String),
    Bool(bool),
    Bulk(String),
    StringArray(Vec<String>),
}

/// Encodes replies to a stream.
pub struct Encoder<W> {
    w: W,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(w: W) -> Self {
        Self { w }
    }

    pub async fn encode(&mut self, reply: &Reply) -> io::Result<()> {
        let mut buf = BytesMut::new();
        write_reply(&mut buf, reply);
        self.w.write_all(&buf).await?;
        self.w.flush().await
    }
}

fn write_reply(buf: &mut BytesMut, reply: &Reply) {
    match reply {
        Reply::Ok => buf.put_slice(b"+OK\r\n"),
        Reply::Pong => buf.put_slice(b"+PONG\r\n"),
        Reply::Error(s) => write_prefixed(buf, b'-', s),
        Reply::Bool(true) => buf.put_slice(b":1\r\n"),
        Reply::Bool(false) => buf.put_slice(b":0\r\n"),
        Reply::Bulk(s) => write_bulk(buf, s),
        Reply::StringArray(items) => {
            write_prefixed(buf, b'*', &items.len().to_string());
            for item in items {
                write_bulk(buf, item);
            }
        }
    }
}

fn write_bulk(buf: &mut BytesMut, s: &str) {
    write_prefixed(buf, b'$', &s.len().to_string());
    buf.put_slice(s.as_bytes());
    buf.put_slice(b"\r\n");
}

fn write_prefixed(buf: &mut BytesMut, prefix: u8, s: &str) {
    buf.put_u8(prefix);
    buf.put_slice(s.as_bytes());
    buf.put_slice(b"\r\n");
}
