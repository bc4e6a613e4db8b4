//! Reverse proxy for the `/api/` prefix
//!
//! Requests keep their full path, prefix included, and are joined onto the
//! upstream origin's own path. One upstream, no retries.

use crate::error::{GatewayBody, GatewayError};
use crate::pool::ConnectionPool;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Prefix routed to the upstream backend
pub const API_PREFIX: &str = "/api/";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that apply to a single connection and are never relayed
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards requests to the configured upstream
pub struct Forwarder {
    upstream: Uri,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl Forwarder {
    /// `upstream` must be an absolute `http://` URI (checked at config load)
    pub fn new(upstream: Uri, pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            upstream,
            pool,
            request_timeout,
        }
    }

    pub fn upstream(&self) -> &Uri {
        &self.upstream
    }

    /// Relay a request and its response
    pub async fn forward(
        &self,
        req: Request<GatewayBody>,
        client_addr: SocketAddr,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let (mut parts, body) = req.into_parts();
        let target = target_uri(&self.upstream, &parts.uri)?;

        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        remove_hop_by_hop_headers(&mut parts.headers);

        // X-Forwarded-* are overwritten, not appended; clients cannot spoof them
        let headers = &mut parts.headers;
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        let original_host = headers
            .get(hyper::header::HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        debug!(
            method = %parts.method,
            uri = %parts.uri,
            target = %target,
            request_id,
            "Forwarding to upstream"
        );

        parts.uri = target;
        let outbound = Request::from_parts(parts, body);

        let mut response = match tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(outbound),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(upstream = %self.upstream, request_id, error = %e, "Upstream request failed");
                return Err(GatewayError::Upstream(e.to_string()));
            }
            Err(_) => {
                warn!(
                    upstream = %self.upstream,
                    request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Upstream request timed out"
                );
                return Err(GatewayError::UpstreamTimeout(self.request_timeout.as_secs()));
            }
        };

        remove_hop_by_hop_headers(response.headers_mut());
        debug!(status = %response.status(), request_id, "Upstream responded");
        Ok(response)
    }
}

/// Build the upstream URI for an inbound request.
///
/// The upstream's path and the request path are joined with exactly one
/// slash; both queries are kept, upstream first.
pub fn target_uri(upstream: &Uri, request: &Uri) -> Result<Uri, GatewayError> {
    let path = single_joining_slash(upstream.path(), request.path());

    let query = match (upstream.query(), request.query()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
        (Some(a), _) if !a.is_empty() => Some(a.to_string()),
        (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
        _ => None,
    };

    let path_and_query = match query {
        Some(q) => format!("{}?{}", path, q),
        None => path,
    };

    let mut builder = Uri::builder().path_and_query(path_and_query);
    if let Some(scheme) = upstream.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = upstream.authority() {
        builder = builder.authority(authority.clone());
    }

    builder
        .build()
        .map_err(|e| GatewayError::Upstream(format!("invalid upstream URI: {}", e)))
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Strip hop-by-hop headers, including any named by `Connection`
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
