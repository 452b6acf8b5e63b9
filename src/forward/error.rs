use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::http::codec::ResponseParseError;
use crate::http::transport::BoxError;

/// Failures of a forwarding operation.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("too many redirects ({0})")]
    TooManyRedirects(usize),
    #[error("{0} response missing Location header")]
    MissingLocationHeader(StatusCode),
    #[error("malformed Location header: {0}")]
    MalformedLocationHeader(String),
    #[error("hostname mismatch: expected {expected}, found {found}")]
    HostMismatch { expected: String, found: String },
    #[error("cannot build outbound request: {0}")]
    InvalidRequest(String),
    #[error("round trip failed: {0}")]
    Transport(#[source] BoxError),
    #[error("error copying upstream response body: {0}")]
    BodyCopy(#[source] io::Error),
    #[error("response sink does not support connection hijacking")]
    HijackUnsupported,
    #[error("unable to hijack the connection: {0}")]
    Hijack(String),
    #[error("unable to write upgrade request to target: {0}")]
    HandshakeWrite(#[source] io::Error),
    #[error("unable to read upgrade response: {0}")]
    MalformedResponse(#[source] ResponseParseError),
    #[error("upgrade rejected with status {0}")]
    UpgradeRejected(StatusCode),
    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),
    #[error("invalid forwarder options: {0}")]
    Config(String),
}

impl ForwardError {
    /// Whether a timeout anywhere in the source chain caused this error.
    pub fn is_timeout(&self) -> bool {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if io_err.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_found_through_source_chain() {
        let err = ForwardError::Dial {
            target: "backend:80".into(),
            source: io::Error::new(io::ErrorKind::TimedOut, "slow"),
        };
        assert!(err.is_timeout());

        let wrapped = ForwardError::Transport(Box::new(io::Error::new(io::ErrorKind::TimedOut, "t")));
        assert!(wrapped.is_timeout());

        assert!(!ForwardError::TooManyRedirects(10).is_timeout());
    }
}
