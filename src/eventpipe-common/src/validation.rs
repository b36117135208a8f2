use crate::event::{parse_event_timestamp, Event, EventType, PARTITION_DATE_FORMAT};
use chrono::NaiveDate;
use eventpipe_config::ValidationConfig;
use thiserror::Error;

/// One problem with one field of an event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("Missing required field: {field}")]
    MissingRequiredField { field: String },

    #[error("Field {field} exceeds maximum length: {max_length}")]
    FieldTooLong { field: String, max_length: usize },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnumValue { field: String, value: String },

    #[error("Timestamp {field} is invalid: {reason}")]
    InvalidTimestamp { field: String, reason: String },

    #[error("Event size {size} bytes exceeds maximum: {max_size} bytes")]
    EventTooLarge { size: usize, max_size: usize },

    #[error("Event could not be serialized: {0}")]
    Unserializable(String),
}

impl FieldError {
    pub fn field(&self) -> &str {
        match self {
            FieldError::MissingRequiredField { field }
            | FieldError::FieldTooLong { field, .. }
            | FieldError::InvalidEnumValue { field, .. }
            | FieldError::InvalidTimestamp { field, .. } => field,
            FieldError::EventTooLarge { .. } | FieldError::Unserializable(_) => "event",
        }
    }
}

/// Batch level shape errors; these reject the whole request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch contains no events")]
    Empty,

    #[error("Batch has {count} events, maximum is {max}")]
    TooManyEvents { count: usize, max: usize },

    #[error("Batch size exceeds maximum: {max_size} bytes")]
    TooLarge { size: usize, max_size: usize },
}

/// Stateless event checks shared by the gateway, the publisher and the consumer
#[derive(Debug, Clone)]
pub struct EventValidator {
    max_event_bytes: usize,
    max_batch_events: usize,
    max_batch_bytes: usize,
    max_id_length: usize,
}

impl EventValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            max_event_bytes: config.max_event_bytes,
            max_batch_events: config.max_batch_events,
            max_batch_bytes: config.max_batch_bytes,
            max_id_length: config.max_id_length,
        }
    }

    pub fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    /// Validate one event, collecting every field problem rather than stopping at the first
    pub fn validate(&self, event: &Event) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        self.check_id("learner_id", &event.learner_id, true, &mut errors);
        self.check_id("event_id", &event.event_id, true, &mut errors);
        if let Some(session_id) = &event.session_id {
            self.check_id("session_id", session_id, false, &mut errors);
        }

        if event.event_type.is_empty() {
            errors.push(FieldError::MissingRequiredField {
                field: "event_type".to_string(),
            });
        } else if event.event_type.parse::<EventType>().is_err() {
            errors.push(FieldError::InvalidEnumValue {
                field: "event_type".to_string(),
                value: event.event_type.clone(),
            });
        }

        if event.timestamp.trim().is_empty() {
            errors.push(FieldError::MissingRequiredField {
                field: "timestamp".to_string(),
            });
        } else if let Err(reason) = parse_event_timestamp(&event.timestamp) {
            errors.push(FieldError::InvalidTimestamp {
                field: "timestamp".to_string(),
                reason,
            });
        }

        if event.version.trim().is_empty() {
            errors.push(FieldError::MissingRequiredField {
                field: "version".to_string(),
            });
        }

        if let Some(date) = &event.partition_date {
            if NaiveDate::parse_from_str(date, PARTITION_DATE_FORMAT).is_err() {
                errors.push(FieldError::InvalidTimestamp {
                    field: "partition_date".to_string(),
                    reason: format!("'{}' is not YYYY-MM-DD", date),
                });
            }
        }

        match serde_json::to_vec(event) {
            Ok(bytes) if bytes.len() > self.max_event_bytes => {
                errors.push(FieldError::EventTooLarge {
                    size: bytes.len(),
                    max_size: self.max_event_bytes,
                });
            }
            Ok(_) => {}
            Err(e) => errors.push(FieldError::Unserializable(e.to_string())),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Check batch count and byte limits before any per-event work
    pub fn validate_batch_shape(&self, event_count: usize, body_bytes: usize) -> Result<(), BatchError> {
        if event_count == 0 {
            return Err(BatchError::Empty);
        }
        if event_count > self.max_batch_events {
            return Err(BatchError::TooManyEvents {
                count: event_count,
                max: self.max_batch_events,
            });
        }
        if body_bytes > self.max_batch_bytes {
            return Err(BatchError::TooLarge {
                size: body_bytes,
                max_size: self.max_batch_bytes,
            });
        }
        Ok(())
    }

    fn check_id(&self, field: &str, value: &str, required: bool, errors: &mut Vec<FieldError>) {
        if value.trim().is_empty() {
            if required {
                errors.push(FieldError::MissingRequiredField {
                    field: field.to_string(),
                });
            }
            return;
        }
        if value.chars().count() > self.max_id_length {
            errors.push(FieldError::FieldTooLong {
                field: field.to_string(),
                max_length: self.max_id_length,
            });
        }
    }
}

/// Join field errors into the single string reported back to callers
pub fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn validator() -> EventValidator {
        EventValidator::new(&ValidationConfig::default())
    }

    fn good_event() -> Event {
        Event::new("L1", EventType::PageView, "E1", "2025-03-14T10:00:00Z")
    }

    #[test]
    fn test_valid_event_passes() {
        assert!(validator().validate(&good_event()).is_ok());
    }

    #[test]
    fn test_collects_all_field_errors() {
        let event: Event = serde_json::from_value(json!({
            "event_type": "teleport",
            "timestamp": "not a time",
            "version": ""
        }))
        .unwrap();

        let errors = validator().validate(&event).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(FieldError::field).collect();
        assert!(fields.contains(&"learner_id"));
        assert!(fields.contains(&"event_id"));
        assert!(fields.contains(&"event_type"));
        assert!(fields.contains(&"timestamp"));
        assert!(fields.contains(&"version"));
    }

    #[test]
    fn test_id_length_limit() {
        let mut event = good_event();
        event.learner_id = "x".repeat(255);
        assert!(validator().validate(&event).is_ok());

        event.learner_id = "x".repeat(256);
        let errors = validator().validate(&event).unwrap_err();
        assert_eq!(
            errors,
            vec![FieldError::FieldTooLong {
                field: "learner_id".to_string(),
                max_length: 255
            }]
        );
    }

    #[test]
    fn test_oversized_event_rejected() {
        let config = ValidationConfig {
            max_event_bytes: 512,
            ..ValidationConfig::default()
        };
        let mut event = good_event();
        event.data.insert("blob".to_string(), json!("a".repeat(1024)));

        let errors = EventValidator::new(&config).validate(&event).unwrap_err();
        assert!(matches!(errors[0], FieldError::EventTooLarge { max_size: 512, .. }));
    }

    #[test]
    fn test_bad_partition_date_stamp() {
        let mut event = good_event();
        event.partition_date = Some("2025-13-40".to_string());
        let errors = validator().validate(&event).unwrap_err();
        assert_eq!(errors[0].field(), "partition_date");
    }

    #[test]
    fn test_validation_is_idempotent() {
        let v = validator();
        let mut event = good_event();
        event.stamp(Utc::now());
        let before = event.clone();

        assert_eq!(v.validate(&event), v.validate(&event));
        assert_eq!(event, before);

        event.event_type = "nope".to_string();
        assert_eq!(v.validate(&event), v.validate(&event));
    }

    #[test]
    fn test_batch_shape_limits() {
        let v = validator();
        assert_eq!(v.validate_batch_shape(0, 10), Err(BatchError::Empty));
        assert!(matches!(
            v.validate_batch_shape(10_001, 10),
            Err(BatchError::TooManyEvents { .. })
        ));
        assert!(matches!(
            v.validate_batch_shape(1, 10 * 1024 * 1024 + 1),
            Err(BatchError::TooLarge { .. })
        ));
        assert!(v.validate_batch_shape(10_000, 1024).is_ok());
    }
}
