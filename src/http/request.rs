//! Inbound request metadata.
//!
//! # Responsibilities
//! - Carry connection facts (peer address, TLS) into the forwarding layer
//! - Preserve the raw request-target as received on the wire
//! - Assign a unique request ID when the client did not send one
//!
//! # Design Decisions
//! - Metadata travels as `http::Extensions` so forwarded copies can drop it
//! - Request ID added as early as possible for tracing

use std::net::SocketAddr;

use http::{HeaderMap, HeaderValue};
use uuid::Uuid;

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Address of the client that sent the inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Marker set when the inbound request arrived over TLS.
///
/// [`HttpServer`](crate::http::HttpServer) accepts plain TCP and never sets
/// it. An embedder that terminates TLS in front of
/// [`Forwarder::serve`](crate::forward::Forwarder::serve) inserts it so that
/// `X-Forwarded-Proto` reads `https`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundTls;

/// The request-target exactly as it appeared on the inbound request line.
///
/// Only meaningful on inbound requests; forwarded copies never carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTarget(pub String);

/// Return the request ID, inserting a fresh UUID v4 if none is present.
pub fn ensure_request_id(headers: &mut HeaderMap) -> String {
    if let Some(id) = headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        return id.to_string();
    }
    let id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(X_REQUEST_ID, value);
    }
    id
}
