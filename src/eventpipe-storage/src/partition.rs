use chrono::{DateTime, Datelike, NaiveDate, Utc};
use eventpipe_common::Event;
use uuid::Uuid;

const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// Partition date for a batch: the first event's stamp, else today (UTC)
pub fn partition_date_for(events: &[Event], now: DateTime<Utc>) -> NaiveDate {
    events
        .first()
        .and_then(Event::partition_naive_date)
        .unwrap_or_else(|| now.date_naive())
}

/// `<prefix>/year=YYYY/month=MM/day=DD/events_<ts>_<batch_id>.parquet`
///
/// `<ts>` is the earliest `processed_at` in the batch, so writing the same
/// batch again produces the same key.
pub fn object_key(prefix: &str, events: &[Event], batch_id: Uuid, now: DateTime<Utc>) -> String {
    let date = partition_date_for(events, now);
    let ts = events
        .iter()
        .filter_map(|e| e.processed_at)
        .min()
        .unwrap_or(now);

    let file = format!(
        "year={:04}/month={:02}/day={:02}/events_{}_{}.parquet",
        date.year(),
        date.month(),
        date.day(),
        ts.format(KEY_TIMESTAMP_FORMAT),
        batch_id
    );

    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file
    } else {
        format!("{}/{}", prefix, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use eventpipe_common::EventType;

    fn stamped(ts: &str, processed_at: DateTime<Utc>) -> Event {
        let mut e = Event::new("L1", EventType::PageView, "E1", ts);
        e.stamp(processed_at);
        e
    }

    #[test]
    fn test_key_partitions_by_event_date() {
        let processed = Utc.with_ymd_and_hms(2025, 3, 15, 1, 2, 3).unwrap();
        let events = vec![stamped("2025-03-14T10:00:00Z", processed)];
        let id = Uuid::nil();

        let key = object_key("learner-events", &events, id, Utc::now());
        assert_eq!(
            key,
            format!(
                "learner-events/year=2025/month=03/day=14/events_20250315T010203000Z_{}.parquet",
                id
            )
        );
    }

    #[test]
    fn test_key_uses_earliest_processed_at() {
        let early = Utc.with_ymd_and_hms(2025, 1, 5, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 5, 9, 0, 0).unwrap();
        let events = vec![
            stamped("2025-01-05T08:00:00Z", late),
            stamped("2025-01-05T08:00:01Z", early),
        ];

        let key = object_key("/lake/", &events, Uuid::nil(), Utc::now());
        assert!(key.starts_with("lake/year=2025/month=01/day=05/events_20250105T080000000Z_"));
    }

    #[test]
    fn test_unstamped_falls_back_to_now() {
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let events = vec![Event::new("L1", EventType::Custom, "E1", "2025-01-05T08:00:00Z")];
        assert_eq!(partition_date_for(&events, now), now.date_naive());
        assert!(object_key("", &events, Uuid::nil(), now).starts_with("year=2026/month=07/day=01/"));
    }
}
