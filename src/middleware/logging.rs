//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Instrument};

/// Logs at INFO for completed requests, WARN for 5xx. Health checks are
/// skipped. The client address is only known when the server was started
/// with connect info.
pub async fn request_logging(
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let client_ip = connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    let start = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    span.in_scope(|| {
        if status >= 500 {
            warn!(status, latency_ms, "Request failed (5xx)");
        } else if status >= 400 {
            info!(status, latency_ms, "Request completed (4xx)");
        } else {
            info!(status, latency_ms, "Request completed");
        }
    });

    response
}
