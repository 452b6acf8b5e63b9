//! Redirect-following connection establishment.
//!
//! # Responsibilities
//! - Dial a location and send a request through a [`RequestDialer`]
//! - Inspect the captured response head for a `302 Found`
//! - Re-dial the new location, relative to the previous hop
//!
//! # Design Decisions
//! - Only 302 is followed; every other status is returned to the caller
//! - Unparseable responses are returned as-is for the caller to interpret
//! - Intermediate connections are dropped before the next hop is dialed

use bytes::Bytes;
use http::header::LOCATION;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::forward::ForwardError;
use crate::http::codec::{read_response_prefix, ResponsePrefix, MAX_RESPONSE_PREFIX};
use crate::net::dial::{BoxConnection, PendingRequest, RequestDialer};
use crate::observability::metrics;

/// Redirects followed before giving up; the tenth redirect fails.
pub const MAX_REDIRECTS: usize = 9;

/// A live connection and the captured start of its response.
pub struct Established {
    /// The caller owns this connection from now on.
    pub connection: BoxConnection,
    pub response: ResponsePrefix,
}

/// Send a request to `location`, following `302 Found` redirects.
///
/// Redirected requests are re-sent as `GET` without a body. When
/// `require_same_host` is set, a redirect to another hostname fails with
/// [`ForwardError::HostMismatch`].
pub async fn connect_with_redirects(
    method: Method,
    location: &Url,
    headers: &HeaderMap,
    body: Option<Bytes>,
    dialer: &dyn RequestDialer,
    require_same_host: bool,
) -> Result<Established, ForwardError> {
    let original = location;
    let mut request = PendingRequest {
        method,
        location: location.clone(),
        headers: headers.clone(),
        body,
    };

    let mut redirects = 0;
    loop {
        if redirects > MAX_REDIRECTS {
            return Err(ForwardError::TooManyRedirects(redirects));
        }

        let mut connection = dialer.dial(&request).await.map_err(|source| ForwardError::Dial {
            target: request.location.to_string(),
            source,
        })?;

        let response = read_response_prefix(&mut connection, MAX_RESPONSE_PREFIX).await;
        let location_header = match &response.head {
            Ok(head) if head.status == StatusCode::FOUND => head.headers.get(LOCATION).cloned(),
            Ok(_) => return Ok(Established { connection, response }),
            Err(e) => {
                tracing::warn!(
                    location = %request.location,
                    error = %e,
                    "Error reading backend response, returning it unparsed"
                );
                return Ok(Established { connection, response });
            }
        };

        drop(connection);

        let redirect = location_header
            .as_ref()
            .map(|value| value.to_str())
            .transpose()
            .map_err(|e| ForwardError::MalformedLocationHeader(e.to_string()))?
            .filter(|value| !value.is_empty())
            .ok_or(ForwardError::MissingLocationHeader(StatusCode::FOUND))?;

        // Relative to the hop that answered, not to the original location.
        let next = request
            .location
            .join(redirect)
            .map_err(|e| ForwardError::MalformedLocationHeader(format!("{redirect:?}: {e}")))?;

        if require_same_host && next.host_str() != original.host_str() {
            return Err(ForwardError::HostMismatch {
                expected: original.host_str().unwrap_or_default().to_string(),
                found: next.host_str().unwrap_or_default().to_string(),
            });
        }

        redirects += 1;
        tracing::debug!(from = %request.location, to = %next, hop = redirects, "Following redirect");
        metrics::record_redirect();

        request.method = Method::GET;
        request.body = None;
        request.location = next;
    }
}
