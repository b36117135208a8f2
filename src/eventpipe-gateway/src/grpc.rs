use eventpipe_common::{Event, DEFAULT_EVENT_VERSION};
use eventpipe_metrics::GATEWAY_ACTIVE_STREAMS;
use prost::Message;
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::service::{IngestService, ParsedEvent};

pub mod proto {
    tonic::include_proto!("eventpipe.ingest.v1");
}

use proto::event_ingest_server::{EventIngest, EventIngestServer};
use proto::{EventAck, EventMessage, SubmitBatchRequest, SubmitBatchResponse};

const GRPC_PROTOCOL: &str = "grpc";
const GRPC_STREAM_PROTOCOL: &str = "grpc_stream";

pub struct GrpcIngest {
    service: Arc<IngestService>,
    ack_buffer: usize,
}

impl GrpcIngest {
    pub fn new(service: Arc<IngestService>, ack_buffer: usize) -> Self {
        Self {
            service,
            ack_buffer: ack_buffer.max(1),
        }
    }

    /// Wrap in the generated server with message size limits applied
    pub fn into_server(self, max_message_bytes: usize) -> EventIngestServer<Self> {
        EventIngestServer::new(self)
            .max_decoding_message_size(max_message_bytes)
            .max_encoding_message_size(max_message_bytes)
    }
}

/// Convert a wire message into an event.
///
/// `data` and `metadata` arrive as JSON text; anything that is not a JSON
/// object makes the message malformed.
pub fn event_from_message(message: EventMessage) -> ParsedEvent {
    let data = json_object("data_json", &message.data_json)?;
    let metadata = json_object("metadata_json", &message.metadata_json)?;

    let version = if message.version.is_empty() {
        DEFAULT_EVENT_VERSION.to_string()
    } else {
        message.version
    };

    Ok(Event {
        learner_id: message.learner_id,
        event_type: message.event_type,
        event_id: message.event_id,
        session_id: message.session_id,
        timestamp: message.timestamp,
        data,
        metadata,
        version,
        processed_at: None,
        partition_date: None,
    })
}

fn json_object(field: &str, text: &str) -> Result<Map<String, Value>, String> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(format!("{} is not a JSON object", field)),
        Err(e) => Err(format!("{} is not valid JSON: {}", field, e)),
    }
}

#[tonic::async_trait]
impl EventIngest for GrpcIngest {
    async fn submit_batch(
        &self,
        request: Request<SubmitBatchRequest>,
    ) -> Result<Response<SubmitBatchResponse>, Status> {
        let request = request.into_inner();
        let body_bytes = request.encoded_len();
        let events = request.events.into_iter().map(event_from_message).collect();

        let response = self
            .service
            .submit_batch(
                GRPC_PROTOCOL,
                events,
                Some(request.batch_id),
                Some(request.source),
                body_bytes,
            )
            .await?;

        Ok(Response::new(SubmitBatchResponse {
            accepted: response.accepted as u32,
            rejected: response.rejected as u32,
            batch_id: response.batch_id,
            message: response.message,
            errors: response.errors,
            status: response.status,
        }))
    }

    type StreamEventsStream = Pin<Box<dyn Stream<Item = Result<EventAck, Status>> + Send>>;

    async fn stream_events(
        &self,
        request: Request<Streaming<EventMessage>>,
    ) -> Result<Response<Self::StreamEventsStream>, Status> {
        let remote = request.remote_addr();
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(self.ack_buffer);
        let service = self.service.clone();

        info!("[GATEWAY] Event stream opened from {:?}", remote);
        tokio::spawn(async move {
            GATEWAY_ACTIVE_STREAMS.inc();
            let mut sequence: u64 = 0;

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("[GATEWAY] Client went away after {} events", sequence);
                        break;
                    }
                    next = inbound.next() => next,
                };

                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(status)) => {
                        debug!("[GATEWAY] Event stream ended with {}", status);
                        break;
                    }
                    None => break,
                };

                // one event at a time keeps acks in request order
                let outcome = service
                    .submit_event(GRPC_STREAM_PROTOCOL, event_from_message(message), None)
                    .await;
                let ack = EventAck {
                    event_id: outcome.event_id,
                    sequence,
                    accepted: outcome.accepted,
                    error: outcome.error,
                };
                sequence += 1;

                if tx.send(Ok(ack)).await.is_err() {
                    break;
                }
            }

            GATEWAY_ACTIVE_STREAMS.dec();
            info!("[GATEWAY] Event stream from {:?} closed after {} events", remote, sequence);
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> EventMessage {
        EventMessage {
            learner_id: "L1".to_string(),
            event_type: "video_play".to_string(),
            event_id: "E1".to_string(),
            session_id: Some("S1".to_string()),
            timestamp: "2025-03-14T10:00:00Z".to_string(),
            data_json: r#"{"video":"intro","position":12}"#.to_string(),
            metadata_json: String::new(),
            version: String::new(),
        }
    }

    #[test]
    fn test_message_to_event() {
        let event = event_from_message(message()).unwrap();
        assert_eq!(event.learner_id, "L1");
        assert_eq!(event.event_type, "video_play");
        assert_eq!(event.session_id.as_deref(), Some("S1"));
        assert_eq!(event.data["video"], "intro");
        assert!(event.metadata.is_empty());
        assert_eq!(event.version, "1.0");
        assert!(event.processed_at.is_none());
    }

    #[test]
    fn test_non_object_json_is_malformed() {
        let mut m = message();
        m.data_json = "[1,2]".to_string();
        assert_eq!(event_from_message(m).unwrap_err(), "data_json is not a JSON object");

        let mut m = message();
        m.metadata_json = "{oops".to_string();
        assert!(event_from_message(m).unwrap_err().starts_with("metadata_json is not valid JSON"));
    }
}
