//! Client-side HTTP/1.1 connection handling.
//!
//! # Responsibilities
//! - Read request heads and chunked request bodies off a buffered client
//!   stream
//! - Write forwarded responses back with correct framing
//! - Hand the raw stream out when a request is upgraded
//!
//! # Design Decisions
//! - The stream stays buffered across keep-alive requests; bytes already
//!   read past a head belong to the next consumer, including a hijacker
//! - Framing follows the response's own `Content-Length` when it has one,
//!   chunked otherwise (close-delimited for HTTP/1.0 clients)
//! - A response whose framing was violated ends the connection

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::forward::rewrite::remove_hop_headers;
use crate::forward::ForwardError;
use crate::http::server::ServerError;
use crate::http::sink::ResponseSink;
use crate::net::dial::BoxConnection;

const MAX_REQUEST_HEADERS: usize = 100;
/// Longest chunk-size line, and the largest trailer section.
const MAX_CHUNK_LINE: usize = 4096;

/// Parsed request line and headers of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request-target exactly as sent.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Whether the client allows the connection to be reused.
    pub fn keep_alive(&self) -> bool {
        let listed = |token: &str| {
            self.headers
                .get_all(CONNECTION)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        };
        match self.version {
            Version::HTTP_11 => !listed("close"),
            _ => listed("keep-alive"),
        }
    }
}

/// Read the next request head from `stream`.
///
/// Returns `Ok(None)` when the client closed the connection between
/// requests. Only the head is consumed; body bytes stay buffered.
pub async fn read_request_head<S>(
    stream: &mut BufStream<S>,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let available = stream.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ServerError::IncompleteHead(buf.len()));
        }

        let before = buf.len();
        let take = available.len().min(max_header_bytes + 1 - before);
        buf.extend_from_slice(&available[..take]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf)? {
            httparse::Status::Complete(head_len) => {
                stream.consume(head_len - before);
                return build_head(&request).map(Some);
            }
            httparse::Status::Partial => {
                stream.consume(take);
                if buf.len() > max_header_bytes {
                    return Err(ServerError::HeadTooLarge(max_header_bytes));
                }
            }
        }
    }
}

fn build_head(request: &httparse::Request<'_, '_>) -> Result<RequestHead, ServerError> {
    let method = request
        .method
        .ok_or_else(|| ServerError::InvalidHead("missing method".into()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ServerError::InvalidHead(format!("invalid method {method:?}")))?;
    let target = request
        .path
        .ok_or_else(|| ServerError::InvalidHead("missing request-target".into()))?
        .to_string();
    let version = match request.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(request.headers.len());
    for header in request.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ServerError::InvalidHead(format!("invalid header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ServerError::InvalidHead(format!("invalid value for {}", header.name)))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Decode a `chunked` request body. Trailers are read and discarded.
///
/// Fails with [`ServerError::BodyTooLarge`] as soon as the decoded size
/// passes `max_body_size`, before that chunk's data is read.
pub async fn read_chunked_body<S>(
    stream: &mut BufStream<S>,
    max_body_size: u64,
) -> Result<Bytes, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = BytesMut::new();

    loop {
        let line = read_chunk_line(stream).await?;
        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            _ => {
                let line = String::from_utf8_lossy(&line);
                return Err(ServerError::InvalidChunk(format!("bad chunk size line {:?}", line.trim_end())));
            }
        };
        if size == 0 {
            break;
        }

        let total = (body.len() as u64).saturating_add(size);
        if total > max_body_size {
            return Err(ServerError::BodyTooLarge(total));
        }
        let start = body.len();
        body.resize(start + size as usize, 0);
        stream.read_exact(&mut body[start..]).await?;

        if read_chunk_line(stream).await? != b"\r\n" {
            return Err(ServerError::InvalidChunk("chunk data not followed by CRLF".into()));
        }
    }

    let mut trailer_bytes = 0;
    loop {
        let line = read_chunk_line(stream).await?;
        if line == b"\r\n" {
            return Ok(body.freeze());
        }
        trailer_bytes += line.len();
        if trailer_bytes > MAX_CHUNK_LINE {
            return Err(ServerError::InvalidChunk("trailer section too large".into()));
        }
    }
}

/// One CRLF-terminated line of chunked framing, terminator included.
async fn read_chunk_line<S>(stream: &mut BufStream<S>) -> Result<Vec<u8>, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        let available = stream.fill_buf().await?;
        if available.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "chunked body ended early").into());
        }
        let (take, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        line.extend_from_slice(&available[..take]);
        stream.consume(take);

        if line.len() > MAX_CHUNK_LINE {
            return Err(ServerError::InvalidChunk("chunk line too long".into()));
        }
        if done {
            return Ok(line);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Head not yet written.
    Pending,
    /// The response has no body (HEAD, 1xx, 204, 304).
    Empty,
    Length { remaining: u64 },
    Chunked,
    /// Body ends when the connection closes.
    Close,
}

/// A [`ResponseSink`] writing to a client connection.
pub struct ConnSink<S = TcpStream> {
    stream: Option<BufStream<S>>,
    headers: HeaderMap,
    framing: Framing,
    head_request: bool,
    version: Version,
    keep_alive: bool,
}

impl<S> ConnSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Sink for the response to a request with `method` and `version`.
    pub fn new(stream: BufStream<S>, method: &Method, version: Version, keep_alive: bool) -> Self {
        Self {
            stream: Some(stream),
            headers: HeaderMap::new(),
            framing: Framing::Pending,
            head_request: *method == Method::HEAD,
            version,
            keep_alive,
        }
    }

    /// Complete the response and return the stream if it can serve another
    /// request. Writes a bare `200 OK` when nothing was written.
    pub async fn finish(mut self) -> io::Result<Option<BufStream<S>>> {
        if self.stream.is_none() {
            return Ok(None);
        }
        if self.framing == Framing::Pending {
            self.write_head(StatusCode::OK).await?;
        }

        let Some(mut stream) = self.stream.take() else {
            return Ok(None);
        };
        match self.framing {
            Framing::Chunked => stream.write_all(b"0\r\n\r\n").await?,
            Framing::Length { remaining } if remaining > 0 => self.keep_alive = false,
            Framing::Close => self.keep_alive = false,
            _ => {}
        }
        stream.flush().await?;

        if self.keep_alive {
            Ok(Some(stream))
        } else {
            let _ = stream.shutdown().await;
            Ok(None)
        }
    }

    fn stream(&mut self) -> io::Result<&mut BufStream<S>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection was hijacked"))
    }

    fn choose_framing(&mut self, status: StatusCode) -> Framing {
        let bodyless = self.head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        if bodyless {
            return Framing::Empty;
        }

        let length = self
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(remaining) = length {
            return Framing::Length { remaining };
        }
        self.headers.remove(CONTENT_LENGTH);

        if self.version == Version::HTTP_11 {
            self.headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Framing::Chunked
        } else {
            self.keep_alive = false;
            Framing::Close
        }
    }
}

#[async_trait]
impl<S> ResponseSink for ConnSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn head_written(&self) -> bool {
        self.framing != Framing::Pending
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        if self.head_written() {
            return Err(io::Error::other("response head already written"));
        }
        self.stream()?;

        remove_hop_headers(&mut self.headers);
        let framing = self.choose_framing(status);
        let connection = match (self.keep_alive, self.version) {
            (false, _) => Some("close"),
            (true, Version::HTTP_10) => Some("keep-alive"),
            _ => None,
        };
        if let Some(connection) = connection {
            self.headers
                .insert(CONNECTION, HeaderValue::from_static(connection));
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        self.framing = framing;
        self.stream()?.write_all(&head).await
    }

    async fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.head_written() {
            self.write_head(StatusCode::OK).await?;
        }
        if data.is_empty() {
            return Ok(());
        }

        match self.framing {
            Framing::Pending | Framing::Empty => Ok(()),
            Framing::Length { remaining } => {
                let allowed = remaining.min(data.len() as u64) as usize;
                if allowed < data.len() {
                    tracing::debug!(
                        excess = data.len() - allowed,
                        "Response body longer than its Content-Length"
                    );
                    self.keep_alive = false;
                }
                self.framing = Framing::Length {
                    remaining: remaining - allowed as u64,
                };
                self.stream()?.write_all(&data[..allowed]).await
            }
            Framing::Chunked => {
                let stream = self.stream()?;
                stream
                    .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                    .await?;
                stream.write_all(data).await?;
                stream.write_all(b"\r\n").await
            }
            Framing::Close => self.stream()?.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush().await
    }

    fn hijack(&mut self) -> Result<BoxConnection, ForwardError> {
        if self.head_written() {
            return Err(ForwardError::Hijack("response already started".into()));
        }
        let stream = self
            .stream
            .take()
            .ok_or_else(|| ForwardError::Hijack("connection already hijacked".into()))?;
        Ok(Box::new(stream))
    }
}
