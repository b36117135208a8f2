use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_EVENT_VERSION: &str = "1.0";
pub const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";

/// Learner activity kinds accepted by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    Interaction,
    AssessmentStart,
    AssessmentComplete,
    LessonStart,
    LessonComplete,
    ResourceAccess,
    Error,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::PageView,
        EventType::Interaction,
        EventType::AssessmentStart,
        EventType::AssessmentComplete,
        EventType::LessonStart,
        EventType::LessonComplete,
        EventType::ResourceAccess,
        EventType::Error,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::Interaction => "interaction",
            EventType::AssessmentStart => "assessment_start",
            EventType::AssessmentComplete => "assessment_complete",
            EventType::LessonStart => "lesson_start",
            EventType::LessonComplete => "lesson_complete",
            EventType::ResourceAccess => "resource_access",
            EventType::Error => "error",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event type '{}'", s))
    }
}

/// A single learner event.
///
/// `event_type` and `timestamp` are kept as the caller sent them so that a bad
/// value surfaces as a field error from the validator instead of a parse
/// failure of the whole event. `processed_at` and `partition_date` are filled
/// in once at the gateway by [`Event::stamp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub learner_id: String,

    #[serde(default)]
    pub event_type: String,

    #[serde(default)]
    pub event_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default)]
    pub timestamp: String,

    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_date: Option<String>,
}

fn default_version() -> String {
    DEFAULT_EVENT_VERSION.to_string()
}

impl Event {
    pub fn new(
        learner_id: impl Into<String>,
        event_type: EventType,
        event_id: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            learner_id: learner_id.into(),
            event_type: event_type.as_str().to_string(),
            event_id: event_id.into(),
            session_id: None,
            timestamp: timestamp.into(),
            data: Map::new(),
            metadata: Map::new(),
            version: default_version(),
            processed_at: None,
            partition_date: None,
        }
    }

    pub fn parsed_event_type(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_event_timestamp(&self.timestamp).ok()
    }

    pub fn is_stamped(&self) -> bool {
        self.processed_at.is_some() && self.partition_date.is_some()
    }

    /// Stamp `processed_at` and `partition_date`.
    ///
    /// An already stamped event is left untouched. The partition date comes
    /// from the event time and falls back to `now` when it does not parse.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        if self.is_stamped() {
            return;
        }
        let event_time = self.parsed_timestamp().unwrap_or(now);
        self.processed_at = Some(now);
        self.partition_date = Some(event_time.format(PARTITION_DATE_FORMAT).to_string());
    }

    /// Stamp at the ingestion boundary, replacing any values the client sent
    pub fn restamp(&mut self, now: DateTime<Utc>) {
        self.processed_at = None;
        self.partition_date = None;
        self.stamp(now);
    }

    pub fn partition_naive_date(&self) -> Option<NaiveDate> {
        self.partition_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, PARTITION_DATE_FORMAT).ok())
    }
}

/// Parse an event timestamp.
///
/// Accepts RFC 3339 and the naive forms `YYYY-MM-DDTHH:MM:SS[.fff]` and
/// `YYYY-MM-DD HH:MM:SS[.fff]`, which are read as UTC.
pub fn parse_event_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("timestamp is empty".to_string());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("'{}' is not a recognised timestamp", raw))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchConstructionError {
    #[error("Event batch must contain at least one event")]
    Empty,
}

/// Ordered, non-empty group of events received together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: String,
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub events: Vec<Event>,
}

impl EventBatch {
    pub fn new(
        batch_id: impl Into<String>,
        source: impl Into<String>,
        received_at: DateTime<Utc>,
        events: Vec<Event>,
    ) -> Result<Self, BatchConstructionError> {
        if events.is_empty() {
            return Err(BatchConstructionError::Empty);
        }
        Ok(Self {
            batch_id: batch_id.into(),
            source: source.into(),
            received_at,
            events,
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Record published to the dead-letter topic. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_payload: String,
    pub reason: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub source: String,
}

impl DeadLetterRecord {
    pub fn new(
        original_payload: impl Into<String>,
        reason: impl Into<String>,
        retry_count: u32,
        source: impl Into<String>,
    ) -> Self {
        Self {
            original_payload: original_payload.into(),
            reason: reason.into(),
            retry_count,
            failed_at: Utc::now(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_event_type_round_trip() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!("click".parse::<EventType>().is_err());
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap();
        assert_eq!(parse_event_timestamp("2025-03-14T10:00:00Z").unwrap(), expected);
        assert_eq!(parse_event_timestamp("2025-03-14T12:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_event_timestamp("2025-03-14T10:00:00").unwrap(), expected);
        assert_eq!(parse_event_timestamp("2025-03-14 10:00:00").unwrap(), expected);
        assert!(parse_event_timestamp("2025-03-14T10:00:00.250").is_ok());
        assert!(parse_event_timestamp("yesterday").is_err());
        assert!(parse_event_timestamp("").is_err());
    }

    #[test]
    fn test_stamp_uses_event_date() {
        let mut event = Event::new("L1", EventType::LessonStart, "E1", "2025-01-05T23:30:00Z");
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 0, 5, 0).unwrap();
        event.stamp(now);

        assert_eq!(event.partition_date.as_deref(), Some("2025-01-05"));
        assert_eq!(event.processed_at, Some(now));

        // second stamp is a no-op
        event.stamp(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(event.processed_at, Some(now));
    }

    #[test]
    fn test_restamp_replaces_client_values() {
        let mut event: Event = serde_json::from_value(json!({
            "learner_id": "L1",
            "event_type": "assessment_complete",
            "event_id": "E1",
            "timestamp": "2025-03-14T10:00:00Z",
            "processed_at": "2020-01-01T00:00:00Z",
            "partition_date": "2031-07-09"
        }))
        .unwrap();
        assert!(event.is_stamped());

        let now = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 5).unwrap();
        event.restamp(now);
        assert_eq!(event.partition_date.as_deref(), Some("2025-03-14"));
        assert_eq!(event.processed_at, Some(now));
    }

    #[test]
    fn test_numbers_survive_serialization_unchanged() {
        let raw = r#"{"learner_id":"L1","event_type":"assessment_complete","event_id":"E1","timestamp":"2025-03-14T10:00:00Z","data":{"score":1.50,"big":123456789012345678901234567890}}"#;
        let event: Event = serde_json::from_str(raw).unwrap();

        let data = serde_json::to_string(&event.data).unwrap();
        assert_eq!(data, r#"{"score":1.50,"big":123456789012345678901234567890}"#);
    }

    #[test]
    fn test_missing_fields_deserialize_to_defaults() {
        let event: Event = serde_json::from_value(json!({"bogus": true})).unwrap();
        assert!(event.learner_id.is_empty());
        assert!(event.event_id.is_empty());
        assert_eq!(event.version, DEFAULT_EVENT_VERSION);
    }

    #[test]
    fn test_data_keeps_insertion_order() {
        let event: Event = serde_json::from_str(
            r#"{"learner_id":"L1","event_type":"custom","event_id":"E","timestamp":"2025-01-01T00:00:00Z",
                "data":{"zeta":1,"alpha":2,"mid":3}}"#,
        )
        .unwrap();
        let keys: Vec<&str> = event.data.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let err = EventBatch::new("b", "edge", Utc::now(), Vec::new()).unwrap_err();
        assert_eq!(err, BatchConstructionError::Empty);
    }
}
