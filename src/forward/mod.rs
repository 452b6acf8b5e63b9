//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! inbound Request<Bytes> + ResponseSink
//!     → Forwarder::serve (upgrade or plain HTTP?)
//!         → http.rs       round trip via Transport, stream body to sink
//!         → websocket.rs  dial target, hijack client, relay raw bytes
//!                         (optionally via redirect.rs to reach the target)
//!     → ErrorHandler for failures before the response started
//! ```
//!
//! # Design Decisions
//! - Forwarder is immutable after construction and shared across requests
//! - Each request gets its own forwarded copy; nothing is aliased
//! - Collaborators are trait objects so tests and embedders can swap them

pub mod copy;
pub mod error;
pub mod handler;
pub mod http;
pub mod redirect;
pub mod rewrite;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use ::http::header::{CONNECTION, UPGRADE};
use ::http::uri::PathAndQuery;
use ::http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, Version};
use bytes::Bytes;

pub use self::error::ForwardError;
pub use self::handler::{DefaultErrorHandler, ErrorHandler};
pub use self::http::HttpForwarder;
pub use self::redirect::{connect_with_redirects, Established, MAX_REDIRECTS};
pub use self::rewrite::{HeaderRewriter, RequestRewriter};
pub use self::websocket::{UpgradeOutcome, UpgradeState, WebsocketForwarder};

use crate::http::request::InboundTarget;
use crate::http::sink::ResponseSink;
use crate::http::transport::{HyperTransport, Transport};
use crate::net::dial::{Dialer, RequestDialer, TcpDialer, TcpRequestDialer};

/// Configuration of a [`Forwarder`]. Unset collaborators get defaults.
#[derive(Clone, Default)]
pub struct ForwarderOptions {
    /// Round-trip capability for plain HTTP. Default: [`HyperTransport`].
    pub transport: Option<Arc<dyn Transport>>,
    /// Raw dialer for upgrade requests. Default: [`TcpDialer`].
    pub dialer: Option<Arc<dyn Dialer>>,
    /// Dialer used when upgrades follow redirects. Default: [`TcpRequestDialer`].
    pub request_dialer: Option<Arc<dyn RequestDialer>>,
    /// Rewriter for plain HTTP requests. Default: [`HeaderRewriter`].
    pub rewriter: Option<Arc<dyn RequestRewriter>>,
    /// Rewriter for upgrade requests. Default: none.
    pub websocket_rewriter: Option<Arc<dyn RequestRewriter>>,
    /// Default: [`DefaultErrorHandler`].
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    /// Send the client's `Host` header upstream instead of the target's.
    pub pass_host_header: bool,
    /// Flush cadence for streamed responses; zero flushes once at the end.
    pub flush_interval: Duration,
    /// Reach upgrade targets through the redirect-following connector.
    pub follow_upgrade_redirects: bool,
    /// Refuse redirects to another hostname.
    pub require_same_host_redirects: bool,
    /// Connect timeout applied to the default transport and dialers.
    pub connect_timeout: Option<Duration>,
}

impl ForwarderOptions {
    fn validate(&self) -> Result<(), ForwardError> {
        if !self.flush_interval.is_zero() && self.flush_interval < Duration::from_millis(1) {
            return Err(ForwardError::Config(format!(
                "flush interval {:?} is below 1ms",
                self.flush_interval
            )));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(ForwardError::Config("connect timeout must be nonzero".into()));
        }
        Ok(())
    }
}

/// Cross-cutting collaborators shared by both forward paths.
#[derive(Clone)]
pub struct HandlerContext {
    pub error_handler: Arc<dyn ErrorHandler>,
}

impl HandlerContext {
    pub(crate) async fn report(
        &self,
        sink: &mut dyn ResponseSink,
        request: &Request<Bytes>,
        error: &ForwardError,
    ) {
        self.error_handler.handle(sink, request, error).await;
    }
}

/// What a single [`Forwarder::serve`] call did.
#[derive(Debug)]
pub enum ForwardOutcome {
    Http {
        /// Upstream status, `None` if the round trip failed.
        status: Option<StatusCode>,
        written: u64,
    },
    Upgrade(UpgradeOutcome),
}

/// Routes each request to the HTTP or the WebSocket forward path.
pub struct Forwarder {
    http: HttpForwarder,
    websocket: WebsocketForwarder,
    context: HandlerContext,
}

impl Forwarder {
    pub fn new(options: ForwarderOptions) -> Result<Self, ForwardError> {
        options.validate()?;

        let dialer: Arc<dyn Dialer> = options
            .dialer
            .unwrap_or_else(|| Arc::new(TcpDialer::new(options.connect_timeout)));
        let request_dialer = options.request_dialer.unwrap_or_else(|| {
            Arc::new(TcpRequestDialer::new(TcpDialer::new(options.connect_timeout)))
        });
        let transport = options
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new(options.connect_timeout)));
        let rewriter = options
            .rewriter
            .unwrap_or_else(|| Arc::new(HeaderRewriter::default()));
        let error_handler = options
            .error_handler
            .unwrap_or_else(|| Arc::new(DefaultErrorHandler));

        Ok(Self {
            http: HttpForwarder {
                transport,
                rewriter: Some(rewriter),
                pass_host_header: options.pass_host_header,
                flush_interval: options.flush_interval,
            },
            websocket: WebsocketForwarder {
                dialer,
                request_dialer,
                rewriter: options.websocket_rewriter,
                follow_redirects: options.follow_upgrade_redirects,
                require_same_host: options.require_same_host_redirects,
            },
            context: HandlerContext { error_handler },
        })
    }

    /// Forward `request`, writing the outcome to `sink`.
    ///
    /// The request URI must be absolute and point at the target.
    pub async fn serve(&self, request: Request<Bytes>, sink: &mut dyn ResponseSink) -> ForwardOutcome {
        if is_websocket_request(request.headers()) {
            ForwardOutcome::Upgrade(self.websocket.serve(request, sink, &self.context).await)
        } else {
            self.http.serve(request, sink, &self.context).await
        }
    }
}

/// Whether the headers describe a WebSocket handshake.
///
/// `Connection` must list `upgrade` and `Upgrade` must list `websocket`,
/// compared as comma-separated, trimmed, case-insensitive tokens.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    has_token(headers, CONNECTION.as_str(), "upgrade") && has_token(headers, UPGRADE.as_str(), "websocket")
}

fn has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Build the outbound copy of an inbound request.
///
/// Headers and URI are independent of the inbound request, the path comes
/// from the raw inbound request-target when available, the version is
/// HTTP/1.1 and a `Connection: close` directive is dropped.
pub(crate) fn forwarded_request(request: &Request<Bytes>) -> Result<Request<Bytes>, ForwardError> {
    let uri = request.uri();
    let (Some(scheme), Some(authority)) = (uri.scheme(), uri.authority()) else {
        return Err(ForwardError::InvalidRequest(format!(
            "request URI {uri} does not name a target"
        )));
    };

    let path_and_query = request
        .extensions()
        .get::<InboundTarget>()
        .and_then(|target| match target.0.parse::<Uri>() {
            Ok(parsed) => parsed.path_and_query().cloned(),
            Err(e) => {
                tracing::warn!(target = %target.0, error = %e, "Error parsing inbound request-target");
                None
            }
        })
        .or_else(|| uri.path_and_query().cloned())
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    let uri = Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;

    let mut headers = HeaderMap::with_capacity(request.headers().len());
    for (name, value) in request.headers() {
        headers.append(name.clone(), value.clone());
    }
    drop_close_directive(&mut headers);

    let mut extensions = request.extensions().clone();
    extensions.remove::<InboundTarget>();

    let mut outbound = Request::new(request.body().clone());
    *outbound.method_mut() = request.method().clone();
    *outbound.uri_mut() = uri;
    *outbound.version_mut() = Version::HTTP_11;
    *outbound.headers_mut() = headers;
    *outbound.extensions_mut() = extensions;
    Ok(outbound)
}

fn drop_close_directive(headers: &mut HeaderMap) {
    if !has_token(headers, CONNECTION.as_str(), "close") {
        return;
    }
    let kept: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty() && !token.eq_ignore_ascii_case("close"))
        .map(str::to_string)
        .collect();
    headers.remove(CONNECTION);
    if !kept.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&kept.join(", ")) {
            headers.insert(CONNECTION, value);
        }
    }
}
