//! Raw HTTP/1.1 wire helpers.
//!
//! # Responsibilities
//! - Capture a bounded response prefix and parse its head
//! - Serialize a request head (and optional body) onto a connection
//!
//! # Design Decisions
//! - The capture is byte-exact so it can be replayed verbatim to a client
//! - Parse failures are values, not errors: callers decide what to do
//! - Capture never exceeds the caller's cap, whatever the peer sends

use std::io;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on captured response bytes.
pub const MAX_RESPONSE_PREFIX: usize = 16384;

const MAX_HEADERS: usize = 128;
const READ_CHUNK: usize = 4096;

/// Why a captured prefix could not be parsed as a response head.
#[derive(Debug, Error)]
pub enum ResponseParseError {
    #[error("connection closed after {0} bytes, before the response head completed")]
    Truncated(usize),
    #[error("response head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed response head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("invalid response header: {0}")]
    InvalidHeader(String),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Parsed status line and headers of a captured response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Length of the head within the raw capture; bytes after it are body.
    pub head_len: usize,
}

/// Byte-exact capture of the start of a response.
#[derive(Debug)]
pub struct ResponsePrefix {
    pub raw: Bytes,
    pub head: Result<ResponseHead, ResponseParseError>,
}

impl ResponsePrefix {
    /// Status code, if the head parsed.
    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().ok().map(|head| head.status)
    }

    /// Bytes read past the end of the head.
    pub fn body_prefix(&self) -> &[u8] {
        match &self.head {
            Ok(head) => &self.raw[head.head_len..],
            Err(_) => &[],
        }
    }
}

/// Read from `reader` until a complete response head is captured, the peer
/// closes, or `cap` bytes have been read.
pub async fn read_response_prefix<R>(reader: &mut R, cap: usize) -> ResponsePrefix
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(cap.min(READ_CHUNK));
    let mut chunk = [0u8; READ_CHUNK];

    let head = loop {
        if buf.len() >= cap {
            break Err(ResponseParseError::TooLarge(cap));
        }
        let want = (cap - buf.len()).min(READ_CHUNK);
        let n = match reader.read(&mut chunk[..want]).await {
            Ok(n) => n,
            Err(e) => break Err(ResponseParseError::Io(e)),
        };
        if n == 0 {
            break Err(ResponseParseError::Truncated(buf.len()));
        }
        buf.extend_from_slice(&chunk[..n]);

        match parse_response_head(&buf) {
            Ok(Some(head)) => break Ok(head),
            Ok(None) => continue,
            Err(e) => break Err(e),
        }
    };

    ResponsePrefix {
        raw: buf.freeze(),
        head,
    }
}

/// Parse a response head from `buf`. `Ok(None)` means more bytes are needed.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, ResponseParseError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let head_len = match response.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let code = response.code.unwrap_or_default();
    let status = StatusCode::from_u16(code)
        .map_err(|_| ResponseParseError::InvalidHeader(format!("status code {code}")))?;

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ResponseParseError::InvalidHeader(header.name.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ResponseParseError::InvalidHeader(header.name.to_string()))?;
        headers.append(name, value);
    }

    Ok(Some(ResponseHead {
        status,
        headers,
        head_len,
    }))
}

/// Serialize a request head. `Host` and `Content-Length` in `headers` are
/// replaced by `host` and the length of `body`.
pub fn encode_request(
    method: &Method,
    target: &str,
    host: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(if target.is_empty() { "/" } else { target }.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nhost: ");
    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Write a request onto `writer` and flush it.
pub async fn write_request<W>(
    writer: &mut W,
    method: &Method,
    target: &str,
    host: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let encoded = encode_request(method, target, host, headers, body);
    writer.write_all(&encoded).await?;
    writer.flush().await
}
