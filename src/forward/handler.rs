//! Turning forwarding failures into client-visible responses.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Request, StatusCode};

use crate::forward::ForwardError;
use crate::http::sink::ResponseSink;

/// Reports a failed forwarding operation to the client.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, sink: &mut dyn ResponseSink, request: &Request<Bytes>, error: &ForwardError);
}

/// Writes `504 Gateway Timeout` for timeouts and `502 Bad Gateway` otherwise.
///
/// Does nothing once a response head has already been sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

impl DefaultErrorHandler {
    pub fn status_for(error: &ForwardError) -> StatusCode {
        if error.is_timeout() {
            StatusCode::GATEWAY_TIMEOUT
        } else {
            StatusCode::BAD_GATEWAY
        }
    }
}

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn handle(&self, sink: &mut dyn ResponseSink, request: &Request<Bytes>, error: &ForwardError) {
        if sink.head_written() {
            tracing::debug!(uri = %request.uri(), error = %error, "Response already started, not reporting error");
            return;
        }

        let status = Self::status_for(error);
        let body = status.canonical_reason().unwrap_or_default();
        let headers = sink.headers_mut();
        headers.clear();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        let written = async {
            sink.write_head(status).await?;
            sink.write_body(body.as_bytes()).await?;
            sink.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::debug!(uri = %request.uri(), error = %e, "Unable to write error response");
        }
    }
}
