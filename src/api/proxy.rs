// Forwarding-header guard for deployments behind a reverse proxy.

use axum::{extract::Request, middleware::Next, response::Response};

use super::error::ApiError;

/// Paths that stay reachable without forwarding headers, so a load
/// balancer can health-check the process directly.
const EXEMPT_PATHS: &[&str] = &["/healthz"];

fn has_header(req: &Request, name: &str) -> bool {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().is_empty())
}

/// Reject requests that did not pass through the proxy.
///
/// - Exempt path: pass through
/// - Both `X-Forwarded-For` and `X-Forwarded-Proto` present: pass through
/// - Otherwise: 403 `proxy_headers_required`
///
/// Runs ahead of every handler, so a stream request without the headers never
/// reaches the upgrade handler.
pub async fn require_forwarded_headers(
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if EXEMPT_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if has_header(&req, "x-forwarded-for") && has_header(&req, "x-forwarded-proto") {
        return Ok(next.run(req).await);
    }

    tracing::warn!(path = %req.uri().path(), "rejecting request without proxy headers");
    Err(ApiError::ProxyHeadersRequired)
}
