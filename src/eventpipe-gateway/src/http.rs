use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use eventpipe_common::Event;
use eventpipe_metrics::{exporter, ComponentHealth, HealthReport};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::GatewayError;
use crate::service::{BatchResponse, IngestService, ParsedEvent};

const HTTP_PROTOCOL: &str = "http";

/// Slack on top of the batch byte limit so oversized bodies still reach the
/// handler and get a structured 413 instead of a bare one.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub service: Arc<IngestService>,
    pub readiness_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    events: Vec<Value>,
    #[serde(default)]
    batch_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

pub fn create_router(state: GatewayState) -> Router {
    let body_limit = state.service.validator().max_batch_bytes() + BODY_LIMIT_SLACK;

    Router::new()
        .route("/v1/events", post(submit_events))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .merge(exporter::router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn submit_events(
    State(state): State<GatewayState>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchResponse>), GatewayError> {
    let max = state.service.validator().max_batch_bytes();
    if body.len() > max {
        return Err(eventpipe_common::BatchError::TooLarge {
            size: body.len(),
            max_size: max,
        }
        .into());
    }

    let request: BatchRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    debug!("[GATEWAY] Received batch of {} events ({} bytes)", request.events.len(), body.len());

    let events = request.events.into_iter().map(parse_event).collect();
    let response = state
        .service
        .submit_batch(HTTP_PROTOCOL, events, request.batch_id, request.source, body.len())
        .await?;

    let status = if response.all_rejected() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

/// Each array element is decoded on its own so one bad element only rejects itself
fn parse_event(value: Value) -> ParsedEvent {
    if !value.is_object() {
        return Err("expected a JSON object".to_string());
    }
    serde_json::from_value::<Event>(value).map_err(|e| e.to_string())
}

async fn liveness() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

async fn readiness(State(state): State<GatewayState>) -> HealthReport {
    let publisher = state.service.publisher();

    let broker = match tokio::time::timeout(state.readiness_timeout, publisher.check_connectivity()).await {
        Ok(Ok(())) => ComponentHealth::healthy("broker"),
        Ok(Err(e)) => ComponentHealth::unhealthy("broker", e.to_string()),
        Err(_) => ComponentHealth::unhealthy(
            "broker",
            format!("no response within {:?}", state.readiness_timeout),
        ),
    };

    let (batches, bytes) = publisher.buffer_usage().await;
    let buffer = if publisher.is_overloaded() {
        ComponentHealth::unhealthy("buffer", format!("overloaded: {} batches, {} bytes", batches, bytes))
    } else if batches > 0 {
        ComponentHealth::degraded("buffer", format!("{} batches awaiting delivery", batches))
    } else {
        ComponentHealth::healthy("buffer")
    };

    HealthReport::from_components(vec![broker, buffer])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::service_with;
    use axum::body::Body;
    use axum::http::Request;
    use eventpipe_config::KafkaConfig;
    use eventpipe_kafka::MemoryBroker;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn router(broker: Arc<MemoryBroker>, dir: &std::path::Path) -> Router {
        create_router(GatewayState {
            service: Arc::new(service_with(broker, dir)),
            readiness_timeout: Duration::from_millis(200),
        })
    }

    async fn post_json(app: Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/events")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_valid_and_bogus_event() {
        let broker = Arc::new(MemoryBroker::new(1));
        let dir = tempdir().unwrap();
        let app = router(broker.clone(), dir.path());

        let (status, body) = post_json(
            app,
            json!({
                "events": [
                    {"learner_id": "L1", "event_type": "lesson_start", "event_id": "E1",
                     "timestamp": "2025-01-05T08:00:00Z"},
                    {"learner_id": "L2", "event_type": "bogus", "event_id": "E2",
                     "timestamp": "2025-01-05T08:00:00Z"}
                ]
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["rejected"], 1);
        assert_eq!(body["errors"].as_array().unwrap().len(), 1);

        let payloads = broker.json_payloads(&KafkaConfig::default().raw_topic);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["event_id"], "E1");
    }

    #[tokio::test]
    async fn test_wrong_field_types_are_malformed_not_fatal() {
        let broker = Arc::new(MemoryBroker::new(1));
        let dir = tempdir().unwrap();
        let app = router(broker, dir.path());

        let (status, body) = post_json(
            app,
            json!({
                "events": [
                    {"learner_id": "L1", "event_type": "assessment_complete", "event_id": "E1",
                     "timestamp": "2025-01-05 08:00:00"},
                    {"learner_id": 42, "event_type": "assessment_complete"},
                    "not an event"
                ]
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["rejected"], 2);
        let errors: Vec<String> = serde_json::from_value(body["errors"].clone()).unwrap();
        assert!(errors.iter().all(|e| e.contains("malformed event")));
    }

    #[tokio::test]
    async fn test_empty_batch_is_bad_request() {
        let dir = tempdir().unwrap();
        let app = router(Arc::new(MemoryBroker::new(1)), dir.path());

        let (status, body) = post_json(app, json!({ "events": [] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_all_invalid_is_bad_request_with_details() {
        let dir = tempdir().unwrap();
        let app = router(Arc::new(MemoryBroker::new(1)), dir.path());

        let (status, body) = post_json(
            app,
            json!({ "events": [{"learner_id": "", "event_type": "page_view", "event_id": "E1",
                                "timestamp": "2025-01-05T08:00:00Z"}] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["accepted"], 0);
        assert_eq!(body["rejected"], 1);
    }

    #[tokio::test]
    async fn test_not_json_is_bad_request() {
        let dir = tempdir().unwrap();
        let app = router(Arc::new(MemoryBroker::new(1)), dir.path());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/events")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_readiness_follows_broker() {
        let broker = Arc::new(MemoryBroker::new(1));
        let dir = tempdir().unwrap();
        let app = router(broker.clone(), dir.path());

        let ready = app
            .clone()
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);

        broker.set_available(false);
        let not_ready = app
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_liveness_and_metrics() {
        let dir = tempdir().unwrap();
        let app = router(Arc::new(MemoryBroker::new(1)), dir.path());

        let live = app
            .clone()
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);

        let metrics = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
    }
}
