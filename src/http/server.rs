//! HTTP/1.1 front server.
//!
//! # Responsibilities
//! - Accept client connections under the listener's connection cap
//! - Read requests (head + `Content-Length` or chunked body) with size limits
//! - Point each request at the configured target and hand it to the
//!   [`Forwarder`] together with a hijack-capable [`ConnSink`]
//! - Keep connections alive between requests, drain them on shutdown
//!
//! # Design Decisions
//! - Requests are read by hand rather than through a server framework:
//!   an upgrade must take over the raw connection before any response
//!   byte is written
//! - Bodies are buffered; a decoded chunked body is forwarded with a
//!   `Content-Length` in place of `Transfer-Encoding`
//! - A connection is closed after any request-level protocol error

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, EXPECT, TRANSFER_ENCODING};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, Version};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::forward::{ForwardError, ForwardOutcome, Forwarder, ForwarderOptions};
use crate::http::conn::{read_chunked_body, read_request_head, ConnSink, RequestHead};
use crate::http::request::{ensure_request_id, ClientAddr, InboundTarget};
use crate::http::sink::ResponseSink;
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};

/// Errors raised while serving client connections.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("connection closed after {0} bytes of a request head")]
    IncompleteHead(usize),
    #[error("malformed request head: {0}")]
    MalformedHead(#[from] httparse::Error),
    #[error("invalid request head: {0}")]
    InvalidHead(String),
    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),
    #[error("request body of {0} bytes exceeds the limit")]
    BodyTooLarge(u64),
    #[error("invalid chunked body: {0}")]
    InvalidChunk(String),
    #[error("unsupported transfer coding {0:?}")]
    UnsupportedTransferEncoding(String),
    #[error("invalid target URL {0:?}")]
    InvalidTarget(String),
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

impl ServerError {
    /// Status to answer the client with, if the error is the client's.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ServerError::HeadTooLarge(_) => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            ServerError::MalformedHead(_)
            | ServerError::InvalidHead(_)
            | ServerError::InvalidContentLength(_)
            | ServerError::InvalidChunk(_) => Some(StatusCode::BAD_REQUEST),
            ServerError::BodyTooLarge(_) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ServerError::UnsupportedTransferEncoding(_) => Some(StatusCode::NOT_IMPLEMENTED),
            _ => None,
        }
    }
}

/// The forwarding proxy's HTTP server.
pub struct HttpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    forwarder: Forwarder,
    scheme: Scheme,
    authority: Authority,
    max_header_bytes: usize,
    max_body_size: u64,
    idle_timeout: Duration,
    drain_timeout: Duration,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Create a server forwarding to the configured target.
    pub fn new(config: &ProxyConfig) -> Result<Self, ServerError> {
        Self::with_options(config, config.forwarder_options())
    }

    /// Create a server with explicit forwarder collaborators.
    pub fn with_options(config: &ProxyConfig, options: ForwarderOptions) -> Result<Self, ServerError> {
        let target: Uri = config
            .target
            .url
            .parse()
            .map_err(|_| ServerError::InvalidTarget(config.target.url.clone()))?;
        let (Some(scheme), Some(authority)) = (target.scheme(), target.authority()) else {
            return Err(ServerError::InvalidTarget(config.target.url.clone()));
        };

        Ok(Self {
            inner: Arc::new(ServerInner {
                forwarder: Forwarder::new(options)?,
                scheme: scheme.clone(),
                authority: authority.clone(),
                max_header_bytes: config.limits.max_header_bytes,
                max_body_size: config.limits.max_body_size as u64,
                idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
                drain_timeout: Duration::from_secs(config.timeouts.shutdown_secs),
                tracker: ConnectionTracker::new(),
            }),
        })
    }

    /// Tracker of the client connections this server has open.
    pub fn tracker(&self) -> ConnectionTracker {
        self.inner.tracker.clone()
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            target = %self.inner.authority,
            "HTTP server starting"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer, permit)) => {
                    let inner = Arc::clone(&self.inner);
                    let guard = inner.tracker.track();
                    let shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        let _permit = permit;
                        inner.serve_connection(stream, peer, guard, shutdown).await;
                    });
                }
                Err(ListenerError::Closed) => return Err(ListenerError::Closed.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "Error accepting connection");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        let remaining = self.inner.tracker.drain(self.inner.drain_timeout).await;
        if remaining > 0 {
            tracing::warn!(remaining, "Connections still open after drain timeout");
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

impl ServerInner {
    async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        guard: ConnectionGuard,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let connection_id = guard.id();
        let mut stream = BufStream::new(stream);

        loop {
            let read = tokio::select! {
                read = tokio::time::timeout(
                    self.idle_timeout,
                    read_request_head(&mut stream, self.max_header_bytes),
                ) => read,
                _ = shutdown.recv() => return,
            };

            let head = match read {
                Ok(Ok(Some(head))) => head,
                Ok(Ok(None)) => {
                    tracing::trace!(%connection_id, "Client closed connection");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(%connection_id, peer_addr = %peer, error = %e, "Error reading request head");
                    reject(stream, &e).await;
                    return;
                }
                Err(_) => {
                    tracing::debug!(%connection_id, "Idle timeout");
                    return;
                }
            };

            match self.serve_request(stream, head, peer, connection_id).await {
                Some(reusable) => stream = reusable,
                None => return,
            }
        }
    }

    /// Serve one request. Returns the stream when it can carry another.
    async fn serve_request(
        &self,
        mut stream: BufStream<TcpStream>,
        head: RequestHead,
        peer: SocketAddr,
        connection_id: ConnectionId,
    ) -> Option<BufStream<TcpStream>> {
        let keep_alive = head.keep_alive();
        let RequestHead {
            method,
            target,
            version,
            mut headers,
        } = head;

        let body = match self.read_body(&mut stream, &mut headers).await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "Error reading request body");
                reject(stream, &e).await;
                return None;
            }
        };

        let request_id = ensure_request_id(&mut headers);
        let uri = match self.target_uri(&target) {
            Ok(uri) => uri,
            Err(e) => {
                reject(stream, &e).await;
                return None;
            }
        };

        let mut request = Request::new(body);
        *request.method_mut() = method.clone();
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = headers;
        request.extensions_mut().insert(ClientAddr(peer));
        request.extensions_mut().insert(InboundTarget(target.clone()));

        let span = tracing::info_span!(
            "request",
            %request_id,
            %connection_id,
            method = %method,
            target = %target,
        );

        let mut sink = ConnSink::new(stream, &method, version, keep_alive);
        let outcome = self
            .forwarder
            .serve(request, &mut sink)
            .instrument(span.clone())
            .await;
        if let ForwardOutcome::Upgrade(upgrade) = &outcome {
            span.in_scope(|| tracing::debug!(state = ?upgrade.state, reached = ?upgrade.reached, "Upgrade finished"));
        }

        match sink.finish().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "Error finishing response");
                None
            }
        }
    }

    async fn read_body(
        &self,
        stream: &mut BufStream<TcpStream>,
        headers: &mut HeaderMap,
    ) -> Result<Bytes, ServerError> {
        let chunked = is_chunked(headers)?;
        let length = if chunked { None } else { Some(content_length(headers)?) };
        match length {
            Some(0) => return Ok(Bytes::new()),
            Some(length) if length > self.max_body_size => {
                return Err(ServerError::BodyTooLarge(length));
            }
            _ => {}
        }

        let expects_continue = headers
            .get(EXPECT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
        if expects_continue {
            stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            stream.flush().await?;
        }

        let Some(length) = length else {
            let body = read_chunked_body(stream, self.max_body_size).await?;
            headers.remove(TRANSFER_ENCODING);
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            return Ok(body);
        };

        let mut body = vec![0u8; length as usize];
        stream.read_exact(&mut body).await?;
        Ok(Bytes::from(body))
    }

    /// Absolute URI on the target for an inbound request-target.
    fn target_uri(&self, target: &str) -> Result<Uri, ServerError> {
        let path_and_query = target
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.path_and_query().cloned())
            .filter(|pq| pq.path().starts_with('/'))
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ServerError::InvalidHead(e.to_string()))
    }
}

/// Whether the body is chunked. `chunked` is the only transfer coding
/// accepted; it overrides any `Content-Length`.
fn is_chunked(headers: &HeaderMap) -> Result<bool, ServerError> {
    let mut codings = Vec::new();
    for value in headers.get_all(TRANSFER_ENCODING) {
        let value = value
            .to_str()
            .map_err(|_| ServerError::UnsupportedTransferEncoding(format!("{value:?}")))?;
        codings.extend(
            value
                .split(',')
                .map(|coding| coding.trim().to_ascii_lowercase())
                .filter(|coding| !coding.is_empty()),
        );
    }
    match codings.as_slice() {
        [] => Ok(false),
        [coding] if coding == "chunked" => Ok(true),
        _ => Err(ServerError::UnsupportedTransferEncoding(codings.join(", "))),
    }
}

fn content_length(headers: &HeaderMap) -> Result<u64, ServerError> {
    let mut values = headers.get_all(CONTENT_LENGTH).iter();
    let Some(first) = values.next() else {
        return Ok(0);
    };
    let raw = first.to_str().unwrap_or_default().trim();
    let length = raw
        .parse::<u64>()
        .map_err(|_| ServerError::InvalidContentLength(raw.to_string()))?;
    if values.any(|other| other != first) {
        return Err(ServerError::InvalidContentLength(raw.to_string()));
    }
    Ok(length)
}

/// Answer a protocol error (when it is the client's) and close.
async fn reject(stream: BufStream<TcpStream>, error: &ServerError) {
    let Some(status) = error.status() else {
        return;
    };
    let mut sink = ConnSink::new(stream, &Method::GET, Version::HTTP_11, false);
    let body = status.canonical_reason().unwrap_or_default();
    let headers = sink.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    let written = async {
        sink.write_head(status).await?;
        sink.write_body(body.as_bytes()).await?;
        sink.finish().await
    }
    .await;
    if let Err(e) = written {
        tracing::debug!(error = %e, "Unable to write error response");
    }
}
