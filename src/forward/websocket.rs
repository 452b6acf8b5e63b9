//! WebSocket (protocol upgrade) forwarding.
//!
//! # Responsibilities
//! - Dial the target directly, bypassing the HTTP transport
//! - Hijack the client connection from the HTTP server machinery
//! - Forward the handshake and its response verbatim
//! - Relay raw bytes both ways once the target switched protocols
//!
//! # Data Flow
//! ```text
//! Dialing → HandshakeSent → AwaitingUpgradeResponse → Relaying → Closed
//!    └──────────────┴──────────────┴─────────────────────┴──→ Failed
//! ```
//!
//! # Design Decisions
//! - Frames are never parsed; after 101 the proxy is a byte pipe
//! - Failures after the hijack have no response channel and are only logged

use std::sync::Arc;

use bytes::Bytes;
use http::header::HOST;
use http::{Request, StatusCode, Uri};
use tokio::io::AsyncWriteExt;
use url::Url;

use super::copy::{relay, RelayEnd};
use super::redirect::connect_with_redirects;
use super::{forwarded_request, ForwardError, HandlerContext, RequestRewriter};
use crate::http::codec::{read_response_prefix, write_request, ResponsePrefix, MAX_RESPONSE_PREFIX};
use crate::http::sink::ResponseSink;
use crate::net::dial::{BoxConnection, Dialer, RequestDialer};
use crate::observability::metrics;

/// Progress of one upgrade forwarding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Dialing,
    HandshakeSent,
    AwaitingUpgradeResponse,
    Relaying,
    Closed,
    Failed,
}

/// Result of forwarding one upgrade request.
#[derive(Debug)]
pub struct UpgradeOutcome {
    /// `Closed` or `Failed`.
    pub state: UpgradeState,
    /// Last state reached before the terminal one.
    pub reached: UpgradeState,
    pub error: Option<ForwardError>,
}

/// Forwards upgrade requests as a raw byte relay.
pub struct WebsocketForwarder {
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) request_dialer: Arc<dyn RequestDialer>,
    pub(crate) rewriter: Option<Arc<dyn RequestRewriter>>,
    pub(crate) follow_redirects: bool,
    pub(crate) require_same_host: bool,
}

struct Session {
    state: UpgradeState,
    uri: Uri,
}

impl Session {
    fn advance(&mut self, next: UpgradeState) {
        tracing::trace!(uri = %self.uri, from = ?self.state, to = ?next, "Upgrade state");
        self.state = next;
    }

    fn fail(self, error: ForwardError) -> UpgradeOutcome {
        let label = match &error {
            ForwardError::UpgradeRejected(_) => "rejected",
            _ => "failed",
        };
        metrics::record_upgrade(label);
        UpgradeOutcome {
            state: UpgradeState::Failed,
            reached: self.state,
            error: Some(error),
        }
    }
}

/// `host:port` to dial for an upgrade target.
///
/// Without an explicit port, `wss` targets use 443 and everything else 80.
pub fn target_address(uri: &Uri) -> Result<String, ForwardError> {
    let host = uri
        .host()
        .ok_or_else(|| ForwardError::InvalidRequest(format!("upgrade target {uri} has no host")))?;
    let port = match uri.port_u16() {
        Some(port) => port,
        None if uri.scheme_str() == Some("wss") => 443,
        None => 80,
    };
    Ok(format!("{host}:{port}"))
}

impl WebsocketForwarder {
    pub(crate) async fn serve(
        &self,
        request: Request<Bytes>,
        sink: &mut dyn ResponseSink,
        ctx: &HandlerContext,
    ) -> UpgradeOutcome {
        let mut session = Session {
            state: UpgradeState::Dialing,
            uri: request.uri().clone(),
        };

        let mut outbound = match forwarded_request(&request) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::error!(uri = %request.uri(), error = %e, "Error building upgrade request");
                ctx.report(sink, &request, &e).await;
                return session.fail(e);
            }
        };
        if let Some(rewriter) = &self.rewriter {
            rewriter.rewrite(&mut outbound);
        }
        session.uri = outbound.uri().clone();

        let (mut target, early_response) = match self.open_target(&outbound).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(uri = %session.uri, error = %e, "Error dialing upgrade target");
                ctx.report(sink, &request, &e).await;
                return session.fail(e);
            }
        };

        let mut client = match sink.hijack() {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(uri = %session.uri, error = %e, "Unable to hijack the connection");
                ctx.report(sink, &request, &e).await;
                return session.fail(e);
            }
        };

        let response = match early_response {
            Some(response) => {
                session.advance(UpgradeState::HandshakeSent);
                response
            }
            None => {
                if let Err(e) = send_handshake(&mut target, &outbound).await {
                    let e = ForwardError::HandshakeWrite(e);
                    tracing::error!(uri = %session.uri, error = %e, "Unable to copy request to target");
                    ctx.report(sink, &request, &e).await;
                    return session.fail(e);
                }
                session.advance(UpgradeState::HandshakeSent);
                read_response_prefix(&mut target, MAX_RESPONSE_PREFIX).await
            }
        };
        session.advance(UpgradeState::AwaitingUpgradeResponse);

        // The client sees the target's answer as-is, including bytes read
        // past the end of the head.
        if !response.raw.is_empty() {
            let forwarded = async {
                client.write_all(&response.raw).await?;
                client.flush().await
            }
            .await;
            if let Err(e) = forwarded {
                tracing::error!(uri = %session.uri, error = %e, "Unable to write upgrade response");
                return session.fail(ForwardError::Relay(e));
            }
        }

        let status = match response.head {
            Ok(head) => head.status,
            Err(e) => {
                tracing::error!(uri = %session.uri, error = %e, "Unable to read upgrade response");
                return session.fail(ForwardError::MalformedResponse(e));
            }
        };
        if status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::warn!(uri = %session.uri, status = status.as_u16(), "Unable to upgrade connection");
            return session.fail(ForwardError::UpgradeRejected(status));
        }

        tracing::info!(uri = %session.uri, "Websocket upgrade");
        session.advance(UpgradeState::Relaying);
        let _active = metrics::UpgradeSessionGauge::new();

        let RelayEnd { direction, result } = relay(client, target).await;
        match result {
            Ok(bytes) => {
                tracing::debug!(uri = %session.uri, %direction, bytes, "Relay finished");
                metrics::record_upgrade("relayed");
                session.advance(UpgradeState::Closed);
                UpgradeOutcome {
                    state: UpgradeState::Closed,
                    reached: UpgradeState::Relaying,
                    error: None,
                }
            }
            Err(e) => {
                tracing::debug!(uri = %session.uri, %direction, error = %e, "Relay failed");
                session.fail(ForwardError::Relay(e))
            }
        }
    }

    /// Connect to the target. When redirects are followed the handshake has
    /// already been sent and its response captured.
    async fn open_target(
        &self,
        outbound: &Request<Bytes>,
    ) -> Result<(BoxConnection, Option<ResponsePrefix>), ForwardError> {
        if !self.follow_redirects {
            let address = target_address(outbound.uri())?;
            let target = self
                .dialer
                .dial(&address)
                .await
                .map_err(|source| ForwardError::Dial { target: address, source })?;
            return Ok((target, None));
        }

        let location = redirect_location(outbound.uri())?;
        let established = connect_with_redirects(
            outbound.method().clone(),
            &location,
            outbound.headers(),
            Some(outbound.body().clone()).filter(|body| !body.is_empty()),
            self.request_dialer.as_ref(),
            self.require_same_host,
        )
        .await?;
        Ok((established.connection, Some(established.response)))
    }
}

/// Location handed to the redirect connector; WebSocket schemes map onto
/// their HTTP equivalents.
fn redirect_location(uri: &Uri) -> Result<Url, ForwardError> {
    let mut location =
        Url::parse(&uri.to_string()).map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
    let scheme = match location.scheme() {
        "ws" => Some("http"),
        "wss" => Some("https"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        location
            .set_scheme(scheme)
            .map_err(|_| ForwardError::InvalidRequest(format!("cannot map scheme of {uri}")))?;
    }
    Ok(location)
}

async fn send_handshake(target: &mut BoxConnection, outbound: &Request<Bytes>) -> std::io::Result<()> {
    let uri = outbound.uri();
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    // The client's Host header travels with the handshake.
    let host = outbound
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_default();
    write_request(target, outbound.method(), path, &host, outbound.headers(), outbound.body()).await
}
