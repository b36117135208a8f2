use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use eventpipe_common::BatchError;
use serde_json::json;
use thiserror::Error;
use tonic::{Code, Status};

use crate::service::BatchResponse;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Overflow buffer at capacity; clients should back off and retry.
    ///
    /// Carries the per-event counts, since part of the batch may already be
    /// on the broker.
    #[error("Pipeline overloaded, retry later: {}", .0.message)]
    Overloaded(Box<BatchResponse>),

    #[error("Failed to publish events: {0}")]
    Publish(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::Batch(BatchError::Empty) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Batch(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            GatewayError::Overloaded(response) => (status, Json(*response)).into_response(),
            other => {
                let body = json!({
                    "status": "error",
                    "error": other.to_string(),
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        match &err {
            GatewayError::InvalidRequest(_) | GatewayError::Batch(BatchError::Empty) => {
                Status::invalid_argument(err.to_string())
            }
            GatewayError::Batch(_) => Status::resource_exhausted(err.to_string()),
            GatewayError::Overloaded(response) => {
                let message = format!(
                    "overloaded: {} accepted, {} rejected",
                    response.accepted, response.rejected
                );
                match serde_json::to_vec(response.as_ref()) {
                    Ok(details) => Status::with_details(Code::Unavailable, message, Bytes::from(details)),
                    Err(_) => Status::unavailable(message),
                }
            }
            GatewayError::Publish(_) => Status::internal(err.to_string()),
        }
    }
}
