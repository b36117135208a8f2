//! Axum router that exposes Prometheus metrics at `/metrics`.

use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tracing::error;

use super::REGISTRY;

/// Build a router that serves `GET /metrics` in Prometheus text format.
///
/// The router is stateless, so it can be merged into any application router.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(metrics_handler))
}

/// Render the registry in Prometheus text format
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();

    let mut buf = Vec::with_capacity(8 * 1024);
    encoder.encode(&families, &mut buf)?;
    Ok(buf)
}

async fn metrics_handler() -> impl IntoResponse {
    match render() {
        Ok(buf) => (
            StatusCode::OK,
            [(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"))],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!("[METRICS] Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WRITER_FILES_TOTAL;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        WRITER_FILES_TOTAL.inc();

        let app: Router = router();
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("eventpipe_writer_files_total"));
    }
}
