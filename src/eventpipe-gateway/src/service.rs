use chrono::Utc;
use eventpipe_common::{describe, Event, EventBatch, EventValidator};
use eventpipe_kafka::{BrokerPublisher, PublishError};
use eventpipe_metrics::{record_gateway_events, GATEWAY_REQUESTS_TOTAL};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;

/// An inbound event, or the reason it could not be read as one
pub type ParsedEvent = Result<Event, String>;

/// Result of a batch submission, shared by HTTP and gRPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// `accepted`, `partial`, `rejected` or `overloaded`
    pub status: String,
    pub accepted: usize,
    pub rejected: usize,
    pub batch_id: String,
    pub message: String,
    pub errors: Vec<String>,
}

impl BatchResponse {
    pub fn all_rejected(&self) -> bool {
        self.accepted == 0
    }
}

/// Outcome for one streamed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    pub event_id: String,
    pub accepted: bool,
    pub error: Option<String>,
}

impl EventOutcome {
    fn rejected(event_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: false,
            error: Some(error.into()),
        }
    }
}

/// Validation, stamping and publishing behind both front doors.
///
/// Holds no mutable state of its own; everything shared lives in the
/// publisher or in the metrics registry.
pub struct IngestService {
    publisher: Arc<BrokerPublisher>,
    validator: EventValidator,
    default_source: String,
}

impl IngestService {
    pub fn new(publisher: Arc<BrokerPublisher>, validator: EventValidator, default_source: impl Into<String>) -> Self {
        Self {
            publisher,
            validator,
            default_source: default_source.into(),
        }
    }

    pub fn publisher(&self) -> &Arc<BrokerPublisher> {
        &self.publisher
    }

    pub fn validator(&self) -> &EventValidator {
        &self.validator
    }

    /// Stamp each event, validate it and publish the valid ones as one batch.
    ///
    /// Invalid and malformed events are reported per event and never reach
    /// the publisher. `body_bytes` is the encoded request size for the batch
    /// byte limit. Any `processed_at` or `partition_date` the client sent is
    /// replaced before validation, so size checks see the stored form.
    pub async fn submit_batch(
        &self,
        protocol: &str,
        events: Vec<ParsedEvent>,
        batch_id: Option<String>,
        source: Option<String>,
        body_bytes: usize,
    ) -> Result<BatchResponse, GatewayError> {
        let started = Instant::now();
        let submitted = events.len();

        let result = self
            .submit_batch_inner(events, batch_id, source, body_bytes)
            .await;

        let status = match &result {
            Ok(response) => {
                record_gateway_events(protocol, response.accepted, response.rejected, started);
                response.status.as_str()
            }
            Err(GatewayError::Overloaded(response)) => {
                record_gateway_events(protocol, response.accepted, response.rejected, started);
                "overloaded"
            }
            Err(_) => {
                record_gateway_events(protocol, 0, submitted, started);
                "error"
            }
        };
        GATEWAY_REQUESTS_TOTAL
            .with_label_values(&[protocol, status])
            .inc();

        result
    }

    async fn submit_batch_inner(
        &self,
        events: Vec<ParsedEvent>,
        batch_id: Option<String>,
        source: Option<String>,
        body_bytes: usize,
    ) -> Result<BatchResponse, GatewayError> {
        let batch_id = batch_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.publisher.is_overloaded() {
            warn!(
                "[GATEWAY] Rejecting batch {} of {} events, overflow buffer is full",
                batch_id,
                events.len()
            );
            return Err(overloaded(
                batch_id,
                0,
                events.len(),
                "Pipeline overloaded, retry later".to_string(),
                Vec::new(),
            ));
        }
        self.validator.validate_batch_shape(events.len(), body_bytes)?;

        let now = Utc::now();
        let source = source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.default_source.clone());

        let mut valid = Vec::with_capacity(events.len());
        let mut errors = Vec::new();

        for (index, parsed) in events.into_iter().enumerate() {
            match parsed {
                Ok(mut event) => {
                    event.restamp(now);
                    match self.validator.validate(&event) {
                        Ok(()) => valid.push(event),
                        Err(field_errors) => {
                            errors.push(event_error(index, &event.event_id, &describe(&field_errors)));
                        }
                    }
                }
                Err(reason) => {
                    errors.push(event_error(index, "", &format!("malformed event: {}", reason)));
                }
            }
        }

        let mut rejected = errors.len();
        if valid.is_empty() {
            debug!("[GATEWAY] Batch {} had no valid events ({} rejected)", batch_id, rejected);
            return Ok(BatchResponse {
                status: "rejected".to_string(),
                accepted: 0,
                rejected,
                batch_id,
                message: "No valid events in batch".to_string(),
                errors,
            });
        }

        let batch = EventBatch::new(batch_id.clone(), source, now, valid)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        let published = match self.publisher.publish(batch).await {
            Ok(result) => result,
            Err(PublishError::Overloaded {
                published,
                dead_lettered,
                rejected: dropped,
            }) => {
                rejected += dead_lettered + dropped;
                if dead_lettered > 0 {
                    errors.push(dead_letter_error(dead_lettered));
                }
                errors.push(format!("{} events rejected: overflow buffer full", dropped));
                let message = format!("{} events accepted, {} rejected", published, rejected);
                warn!("[GATEWAY] Batch {} hit a full overflow buffer: {}", batch_id, message);
                return Err(overloaded(batch_id, published, rejected, message, errors));
            }
            Err(e) => return Err(GatewayError::Publish(e.to_string())),
        };

        if published.dead_lettered > 0 {
            rejected += published.dead_lettered;
            errors.push(dead_letter_error(published.dead_lettered));
        }
        let accepted = published.published + published.buffered;

        let mut message = format!("{} events accepted, {} rejected", accepted, rejected);
        if published.buffered > 0 {
            message.push_str(&format!(" ({} buffered for later delivery)", published.buffered));
        }
        info!("[GATEWAY] Batch {}: {}", batch_id, message);

        Ok(BatchResponse {
            status: if rejected == 0 { "accepted" } else { "partial" }.to_string(),
            accepted,
            rejected,
            batch_id,
            message,
            errors,
        })
    }

    /// Validate and publish a single streamed event
    pub async fn submit_event(&self, protocol: &str, parsed: ParsedEvent, source: Option<&str>) -> EventOutcome {
        let started = Instant::now();
        let outcome = self.submit_event_inner(parsed, source).await;

        let (accepted, rejected) = if outcome.accepted { (1, 0) } else { (0, 1) };
        record_gateway_events(protocol, accepted, rejected, started);
        outcome
    }

    async fn submit_event_inner(&self, parsed: ParsedEvent, source: Option<&str>) -> EventOutcome {
        let mut event = match parsed {
            Ok(event) => event,
            Err(reason) => return EventOutcome::rejected("", format!("malformed event: {}", reason)),
        };
        if self.publisher.is_overloaded() {
            return EventOutcome::rejected(event.event_id, "overloaded");
        }

        let now = Utc::now();
        event.restamp(now);
        if let Err(field_errors) = self.validator.validate(&event) {
            return EventOutcome::rejected(event.event_id, describe(&field_errors));
        }

        let event_id = event.event_id.clone();
        let source = source.unwrap_or(&self.default_source);

        let batch = match EventBatch::new(Uuid::new_v4().to_string(), source, now, vec![event]) {
            Ok(batch) => batch,
            Err(e) => return EventOutcome::rejected(event_id, e.to_string()),
        };

        match self.publisher.publish(batch).await {
            Ok(result) if result.published + result.buffered == 1 => EventOutcome {
                event_id,
                accepted: true,
                error: None,
            },
            Ok(_) => EventOutcome::rejected(event_id, "failed re-validation, sent to dead-letter topic"),
            Err(PublishError::Overloaded { .. }) => EventOutcome::rejected(event_id, "overloaded"),
            Err(e) => EventOutcome::rejected(event_id, e.to_string()),
        }
    }
}

fn overloaded(
    batch_id: String,
    accepted: usize,
    rejected: usize,
    message: String,
    errors: Vec<String>,
) -> GatewayError {
    GatewayError::Overloaded(Box::new(BatchResponse {
        status: "overloaded".to_string(),
        accepted,
        rejected,
        batch_id,
        message,
        errors,
    }))
}

fn dead_letter_error(count: usize) -> String {
    format!("{} events failed re-validation and were dead-lettered", count)
}

fn event_error(index: usize, event_id: &str, reason: &str) -> String {
    if event_id.is_empty() {
        format!("event[{}]: {}", index, reason)
    } else {
        format!("event[{}] ({}): {}", index, event_id, reason)
    }
}
