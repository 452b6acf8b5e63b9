//! Response sink: where forwarded responses are written.

use std::io;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};

use crate::forward::ForwardError;
use crate::net::dial::BoxConnection;

/// Destination of a forwarded response.
///
/// Headers are collected in [`headers_mut`](ResponseSink::headers_mut) and
/// sent by [`write_head`](ResponseSink::write_head). Changes to the header map
/// after that point are not transmitted.
#[async_trait]
pub trait ResponseSink: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Whether the status line has already been sent.
    fn head_written(&self) -> bool;

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()>;

    async fn write_body(&mut self, data: &[u8]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;

    /// Take exclusive ownership of the underlying client connection.
    ///
    /// After a successful hijack the sink must not be written to.
    fn hijack(&mut self) -> Result<BoxConnection, ForwardError> {
        Err(ForwardError::HijackUnsupported)
    }
}
