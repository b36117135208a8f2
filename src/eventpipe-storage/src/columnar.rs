use arrow::array::{ArrayRef, DictionaryArray, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Int32Type, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use eventpipe_common::{parse_event_timestamp, Event, WriteError};
use eventpipe_config::CompressionCodec;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use std::sync::Arc;
use uuid::Uuid;

const UTC: &str = "UTC";

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into()))
}

fn dictionary_type() -> DataType {
    DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
}

/// Column layout of every lake file
pub fn event_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("event_id", DataType::Utf8, false),
        Field::new("learner_id", DataType::Utf8, false),
        Field::new("event_type", dictionary_type(), false),
        Field::new("session_id", DataType::Utf8, true),
        Field::new("timestamp", timestamp_type(), false),
        Field::new("data", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("version", dictionary_type(), false),
        Field::new("processed_at", timestamp_type(), false),
        Field::new("partition_date", dictionary_type(), false),
    ]))
}

/// Convert events to one Arrow record batch.
///
/// Events that were never stamped get `now` as `processed_at` and their
/// event date as `partition_date`.
pub fn events_to_record_batch(events: &[Event], now: DateTime<Utc>) -> Result<RecordBatch, WriteError> {
    let mut timestamps = Vec::with_capacity(events.len());
    let mut processed = Vec::with_capacity(events.len());
    let mut partition_dates = Vec::with_capacity(events.len());
    let mut data = Vec::with_capacity(events.len());
    let mut metadata = Vec::with_capacity(events.len());

    for event in events {
        let ts = parse_event_timestamp(&event.timestamp)
            .map_err(|e| WriteError::Encode(format!("event {}: {}", event.event_id, e)))?;
        timestamps.push(ts.timestamp_micros());
        processed.push(event.processed_at.unwrap_or(now).timestamp_micros());
        partition_dates.push(
            event
                .partition_date
                .clone()
                .unwrap_or_else(|| ts.format("%Y-%m-%d").to_string()),
        );
        data.push(to_json(&event.data)?);
        metadata.push(to_json(&event.metadata)?);
    }

    let event_types: DictionaryArray<Int32Type> =
        events.iter().map(|e| e.event_type.as_str()).collect();
    let versions: DictionaryArray<Int32Type> = events.iter().map(|e| e.version.as_str()).collect();
    let dates: DictionaryArray<Int32Type> = partition_dates.iter().map(String::as_str).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(events.iter().map(|e| e.event_id.as_str()))),
        Arc::new(StringArray::from_iter_values(events.iter().map(|e| e.learner_id.as_str()))),
        Arc::new(event_types),
        Arc::new(StringArray::from(
            events.iter().map(|e| e.session_id.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone(UTC)),
        Arc::new(StringArray::from(data)),
        Arc::new(StringArray::from(metadata)),
        Arc::new(versions),
        Arc::new(TimestampMicrosecondArray::from(processed).with_timezone(UTC)),
        Arc::new(dates),
    ];

    RecordBatch::try_new(event_schema(), columns).map_err(|e| WriteError::Encode(e.to_string()))
}

fn to_json(map: &serde_json::Map<String, serde_json::Value>) -> Result<String, WriteError> {
    serde_json::to_string(map).map_err(|e| WriteError::Encode(e.to_string()))
}

fn parquet_compression(codec: CompressionCodec) -> Result<Compression, WriteError> {
    Ok(match codec {
        CompressionCodec::Zstd => Compression::ZSTD(
            ZstdLevel::try_new(3).map_err(|e| WriteError::Encode(e.to_string()))?,
        ),
        CompressionCodec::Snappy => Compression::SNAPPY,
        CompressionCodec::Gzip => Compression::GZIP(GzipLevel::default()),
        CompressionCodec::Lz4 => Compression::LZ4_RAW,
        CompressionCodec::None => Compression::UNCOMPRESSED,
    })
}

/// Encode events as one Parquet file in memory
pub fn encode_parquet(
    events: &[Event],
    batch_id: Uuid,
    codec: CompressionCodec,
    now: DateTime<Utc>,
) -> Result<Vec<u8>, WriteError> {
    let batch = events_to_record_batch(events, now)?;

    let props = WriterProperties::builder()
        .set_compression(parquet_compression(codec)?)
        .set_key_value_metadata(Some(vec![
            KeyValue::new("source".to_string(), "event-pipeline".to_string()),
            KeyValue::new("format".to_string(), "parquet".to_string()),
            KeyValue::new("compression".to_string(), codec.to_string()),
            KeyValue::new("event_count".to_string(), events.len().to_string()),
            KeyValue::new("batch_id".to_string(), batch_id.to_string()),
        ]))
        .build();

    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(props))
        .map_err(|e| WriteError::Encode(e.to_string()))?;
    writer
        .write(&batch)
        .map_err(|e| WriteError::Encode(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| WriteError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::TimestampMicrosecondType;
    use chrono::TimeZone;
    use eventpipe_common::EventType;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;

    fn read_batches(bytes: Vec<u8>) -> (Vec<RecordBatch>, Vec<(String, Option<String>)>) {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes)).unwrap();
        let kv = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect();
        let batches = builder.build().unwrap().map(|b| b.unwrap()).collect();
        (batches, kv)
    }

    fn sample() -> Vec<Event> {
        let processed = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 5).unwrap();
        let mut a = Event::new("L1", EventType::LessonStart, "E1", "2025-03-14T10:00:00Z");
        a.session_id = Some("S1".to_string());
        a.data.insert("lesson".to_string(), json!("algebra-1"));
        a.data.insert("attempt".to_string(), json!(2));
        a.stamp(processed);
        let mut b = Event::new("L2", EventType::PageView, "E2", "2025-03-14 10:00:01");
        b.stamp(processed);
        vec![a, b]
    }

    #[test]
    fn test_schema_types() {
        let schema = event_schema();
        assert_eq!(schema.field_with_name("timestamp").unwrap().data_type(), &timestamp_type());
        assert_eq!(schema.field_with_name("event_type").unwrap().data_type(), &dictionary_type());
        assert!(schema.field_with_name("session_id").unwrap().is_nullable());
    }

    #[test]
    fn test_record_batch_values() {
        let batch = events_to_record_batch(&sample(), Utc::now()).unwrap();
        assert_eq!(batch.num_rows(), 2);

        let ts = batch.column_by_name("timestamp").unwrap().as_primitive::<TimestampMicrosecondType>();
        let expected = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap().timestamp_micros();
        assert_eq!(ts.value(0), expected);
        assert_eq!(ts.value(1), expected + 1_000_000);

        let data = batch.column_by_name("data").unwrap().as_string::<i32>();
        assert_eq!(data.value(0), r#"{"lesson":"algebra-1","attempt":2}"#);

        let sessions = batch.column_by_name("session_id").unwrap();
        assert!(sessions.is_null(1));
    }

    #[test]
    fn test_data_column_keeps_number_text() {
        let payload = br#"{"learner_id":"L1","event_type":"assessment_complete","event_id":"E9","timestamp":"2025-03-14T10:00:00Z","data":{"score":1.50,"big":123456789012345678901234567890},"metadata":{"weight":0.10}}"#;
        let event: Event = serde_json::from_slice(payload).unwrap();

        let batch = events_to_record_batch(&[event], Utc::now()).unwrap();
        let data = batch.column_by_name("data").unwrap().as_string::<i32>();
        assert_eq!(data.value(0), r#"{"score":1.50,"big":123456789012345678901234567890}"#);
        let metadata = batch.column_by_name("metadata").unwrap().as_string::<i32>();
        assert_eq!(metadata.value(0), r#"{"weight":0.10}"#);
    }

    #[test]
    fn test_parquet_round_trip_with_metadata() {
        for codec in [CompressionCodec::Zstd, CompressionCodec::Snappy, CompressionCodec::None] {
            let id = Uuid::new_v4();
            let bytes = encode_parquet(&sample(), id, codec, Utc::now()).unwrap();
            let (batches, kv) = read_batches(bytes);

            let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
            assert_eq!(rows, 2);
            assert!(kv.contains(&("compression".to_string(), Some(codec.to_string()))));
            assert!(kv.contains(&("batch_id".to_string(), Some(id.to_string()))));
            assert!(kv.contains(&("event_count".to_string(), Some("2".to_string()))));
        }
    }

    #[test]
    fn test_unparseable_timestamp_is_encode_error() {
        let mut events = sample();
        events[1].timestamp = "soon".to_string();
        assert!(matches!(
            events_to_record_batch(&events, Utc::now()),
            Err(WriteError::Encode(_))
        ));
    }
}
