//! Request count and latency metrics

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use ragline_common::metrics::RequestMetrics;

/// Record one request, labeled by route template rather than raw path so
/// session and chat ids don't explode label cardinality.
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let tracker = RequestMetrics::start(&method, &path);
    let response = next.run(request).await;
    tracker.finish(response.status().as_u16());

    response
}
