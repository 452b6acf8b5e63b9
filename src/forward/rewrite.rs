//! Outbound request rewriting.
//!
//! # Responsibilities
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host
//! - Strip hop-by-hop headers
//!
//! # Design Decisions
//! - Never trust existing X-Forwarded-* unless configured to
//! - Client IP is appended, so chains of proxies stay visible

use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderValue, Request};

use crate::http::request::{ClientAddr, InboundTls};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_SERVER: &str = "x-forwarded-server";

const FORWARDED_HEADERS: [&str; 4] = [
    X_FORWARDED_FOR,
    X_FORWARDED_PROTO,
    X_FORWARDED_HOST,
    X_FORWARDED_SERVER,
];

/// Mutates an outbound request in place before it is sent.
pub trait RequestRewriter: Send + Sync {
    fn rewrite(&self, request: &mut Request<Bytes>);
}

/// Default rewriter for the HTTP forward path.
#[derive(Debug, Clone, Default)]
pub struct HeaderRewriter {
    /// Keep X-Forwarded-* headers sent by the client.
    pub trust_forward_header: bool,
    /// Value for X-Forwarded-Server, if any.
    pub hostname: Option<String>,
}

impl RequestRewriter for HeaderRewriter {
    fn rewrite(&self, request: &mut Request<Bytes>) {
        let client_ip = request.extensions().get::<ClientAddr>().map(|addr| addr.0.ip());
        let tls = request.extensions().get::<InboundTls>().is_some();
        let headers = request.headers_mut();

        if !self.trust_forward_header {
            for name in FORWARDED_HEADERS {
                headers.remove(name);
            }
        }

        if let Some(ip) = client_ip {
            let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
                _ => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let proto = if tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        if let Some(host) = headers.get(HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }

        if let Some(hostname) = &self.hostname {
            if let Ok(value) = HeaderValue::from_str(hostname) {
                headers.insert(X_FORWARDED_SERVER, value);
            }
        }

        remove_hop_headers(headers);
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE] {
        headers.remove(name);
    }
    for name in ["keep-alive", "proxy-authenticate", "proxy-authorization", "proxy-connection"] {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn request_from(addr: &str) -> Request<Bytes> {
        let mut request = Request::builder()
            .uri("http://backend/path")
            .header(HOST, "public.example")
            .header(CONNECTION, "keep-alive, x-private")
            .header("keep-alive", "timeout=5")
            .header("x-private", "secret")
            .header(UPGRADE, "h2c")
            .body(Bytes::new())
            .unwrap();
        let addr: SocketAddr = addr.parse().unwrap();
        request.extensions_mut().insert(ClientAddr(addr));
        request
    }

    #[test]
    fn sets_forwarded_headers_and_strips_hop_headers() {
        let mut request = request_from("10.0.0.7:5555");
        request
            .headers_mut()
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("6.6.6.6"));

        HeaderRewriter::default().rewrite(&mut request);

        let headers = request.headers();
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.7");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
        assert_eq!(headers[X_FORWARDED_HOST], "public.example");
        assert!(headers.get(X_FORWARDED_SERVER).is_none());
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-private").is_none());
        assert!(headers.get(UPGRADE).is_none());
        assert_eq!(headers[HOST], "public.example");
    }

    #[test]
    fn trusted_forward_header_is_extended() {
        let mut request = request_from("10.0.0.7:5555");
        request.extensions_mut().insert(InboundTls);
        request
            .headers_mut()
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));

        let rewriter = HeaderRewriter {
            trust_forward_header: true,
            hostname: Some("proxy-1".into()),
        };
        rewriter.rewrite(&mut request);

        let headers = request.headers();
        assert_eq!(headers[X_FORWARDED_FOR], "1.2.3.4, 10.0.0.7");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert_eq!(headers[X_FORWARDED_SERVER], "proxy-1");
    }
}
