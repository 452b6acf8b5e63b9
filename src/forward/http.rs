//! Plain HTTP forwarding.
//!
//! # Responsibilities
//! - Build the outbound request (target URI, rewritten headers, Host)
//! - Execute the round trip through the configured transport
//! - Copy status, headers and the streamed body back to the client
//!
//! # Design Decisions
//! - No retries here; retry policy belongs to the transport
//! - The Content-Length set after copying is advisory: with a flush
//!   interval the head is already on the wire when it is set

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Request};

use super::{forwarded_request, ForwardError, ForwardOutcome, HandlerContext, RequestRewriter};
use crate::forward::copy::copy_response;
use crate::http::request::InboundTls;
use crate::http::sink::ResponseSink;
use crate::http::transport::Transport;
use crate::observability::metrics;

/// Forwards plain HTTP requests through a [`Transport`].
pub struct HttpForwarder {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) rewriter: Option<Arc<dyn RequestRewriter>>,
    pub(crate) pass_host_header: bool,
    pub(crate) flush_interval: Duration,
}

impl HttpForwarder {
    /// Build the request sent to the transport.
    pub fn outbound_request(&self, request: &Request<Bytes>) -> Result<Request<Bytes>, ForwardError> {
        let mut outbound = forwarded_request(request)?;

        if let Some(rewriter) = &self.rewriter {
            rewriter.rewrite(&mut outbound);
        }

        if !self.pass_host_header {
            if let Some(authority) = outbound.uri().authority() {
                let host = HeaderValue::from_str(authority.as_str())
                    .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
                outbound.headers_mut().insert(HOST, host);
            }
        }
        Ok(outbound)
    }

    pub(crate) async fn serve(
        &self,
        request: Request<Bytes>,
        sink: &mut dyn ResponseSink,
        ctx: &HandlerContext,
    ) -> ForwardOutcome {
        let start = Instant::now();
        let method = request.method().clone();

        let outbound = match self.outbound_request(&request) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::error!(uri = %request.uri(), error = %e, "Error building outbound request");
                ctx.report(sink, &request, &e).await;
                return ForwardOutcome::Http { status: None, written: 0 };
            }
        };
        let target = outbound.uri().clone();

        let response = match self.transport.round_trip(outbound).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(uri = %target, error = %e, "Error forwarding request");
                metrics::record_transport_failure(method.as_str());
                ctx.report(sink, &request, &ForwardError::Transport(e)).await;
                return ForwardOutcome::Http { status: None, written: 0 };
            }
        };

        let status = response.status();
        tracing::info!(
            method = %method,
            uri = %target,
            status = status.as_u16(),
            duration = ?start.elapsed(),
            tls = request.extensions().get::<InboundTls>().is_some(),
            "Round trip"
        );
        metrics::record_round_trip(method.as_str(), status.as_u16(), start);

        let (parts, body) = response.into_parts();
        copy_headers(sink.headers_mut(), &parts.headers);
        if let Err(e) = sink.write_head(status).await {
            tracing::debug!(uri = %target, error = %e, "Client went away before response head");
            return ForwardOutcome::Http { status: Some(status), written: 0 };
        }

        let written = match copy_response(sink, body, self.flush_interval).await {
            Ok(written) => written,
            Err(e) => {
                tracing::error!(uri = %target, error = %e, "Error copying upstream response body");
                ctx.report(sink, &request, &ForwardError::BodyCopy(e)).await;
                return ForwardOutcome::Http { status: Some(status), written: 0 };
            }
        };

        if written != 0 {
            sink.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(written));
        }
        ForwardOutcome::Http { status: Some(status), written }
    }
}

/// Append every header of `src` to `dst`.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}
