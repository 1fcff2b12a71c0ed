//! Request ids and per-request logging for the HTTP gateway

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Generate a new unique request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn request_id_of(request: &Request<Body>) -> String {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id)
}

/// Tag each request with an id, run it inside a span and log the outcome.
///
/// The peer address is logged when the server was started with connect
/// info; routers driven directly (tests) simply omit it.
pub async fn request_tracing_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let start = Instant::now();
    let request_id = request_id_of(&request);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    let mut response = next.run(request).instrument(span.clone()).await;

    let _guard = span.enter();
    let duration = start.elapsed();
    let status = response.status();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    if status.is_success() || status.is_redirection() {
        info!(
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "Request completed"
        );
    } else if status.is_client_error() {
        warn!(
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "Client error"
        );
    } else {
        warn!(
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            "Server error"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();

        assert!(Uuid::parse_str(&id1).is_ok());
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_request_id_reused_from_header() {
        let request = Request::builder()
            .uri("/kv/x")
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_id_of(&request), "abc-123");

        let request = Request::builder().uri("/kv/x").body(Body::empty()).unwrap();
        assert!(Uuid::parse_str(&request_id_of(&request)).is_ok());
    }
}
