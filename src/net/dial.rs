//! Outbound connection capabilities.
//!
//! # Responsibilities
//! - Define the raw byte-stream type handed between components
//! - Dial a `host:port` address (WebSocket path)
//! - Dial a location and send a request on it (redirect connector)
//!
//! # Design Decisions
//! - Ownership of a connection moves by value; dropping it closes it
//! - TLS is not handled here; secure schemes need a custom dialer
//! - Timeouts belong to the dialer, not to the forwarding layer

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use url::Url;

use crate::http::codec::write_request;

/// A bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased connection.
pub type BoxConnection = Box<dyn Connection>;

/// Opens a raw connection to `host:port`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<BoxConnection>;
}

/// A request waiting to be sent by a [`RequestDialer`].
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub method: Method,
    pub location: Url,
    /// Owned snapshot of the caller's headers.
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Connects to the host named by a request's location and writes the request.
#[async_trait]
pub trait RequestDialer: Send + Sync {
    async fn dial(&self, request: &PendingRequest) -> io::Result<BoxConnection>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxConnection> {
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
                })??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        tracing::trace!(addr = %addr, "Dialed target");
        Ok(Box::new(stream))
    }
}

/// Request dialer that writes an HTTP/1.1 request over a [`Dialer`].
///
/// Only the plaintext schemes (`http`, `ws`) are supported.
pub struct TcpRequestDialer<D = TcpDialer> {
    dialer: D,
}

impl<D: Dialer> TcpRequestDialer<D> {
    pub fn new(dialer: D) -> Self {
        Self { dialer }
    }
}

impl Default for TcpRequestDialer<TcpDialer> {
    fn default() -> Self {
        Self::new(TcpDialer::default())
    }
}

#[async_trait]
impl<D: Dialer> RequestDialer for TcpRequestDialer<D> {
    async fn dial(&self, request: &PendingRequest) -> io::Result<BoxConnection> {
        let location = &request.location;
        match location.scheme() {
            "http" | "ws" => {}
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("scheme {other:?} requires a TLS-capable dialer"),
                ))
            }
        }
        let host = location
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "location has no host"))?;
        let port = location.port_or_known_default().unwrap_or(80);
        // IPv6 hosts are already bracketed by `host_str`.
        let addr = format!("{host}:{port}");

        let mut conn = self.dialer.dial(&addr).await?;

        let mut target = location.path().to_string();
        if let Some(query) = location.query() {
            target.push('?');
            target.push_str(query);
        }
        let authority = match location.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        write_request(
            &mut conn,
            &request.method,
            &target,
            &authority,
            &request.headers,
            request.body.as_deref().unwrap_or_default(),
        )
        .await?;
        Ok(conn)
    }
}
