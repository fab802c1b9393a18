//! Event payloads, ingest options and the ingest status reported by the API.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Field the server reads the event time from unless told otherwise.
pub const DEFAULT_TIMESTAMP_FIELD: &str = "_time";

/// A single telemetry event. Any JSON value is accepted; objects get a
/// timestamp injected when they lack one.
pub type Event = serde_json::Value;

/// Per-call ingest options. Events with different options never share a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Field holding the event time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_field: Option<String>,

    /// Format of the event time, if not RFC 3339
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_format: Option<String>,

    /// Delimiter for CSV payloads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv_delimiter: Option<String>,
}

impl IngestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    pub fn timestamp_format(mut self, format: impl Into<String>) -> Self {
        self.timestamp_format = Some(format.into());
        self
    }

    pub fn csv_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.csv_delimiter = Some(delimiter.into());
        self
    }

    /// Query parameters sent with the ingest request, in a fixed order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        [
            ("timestamp-field", &self.timestamp_field),
            ("timestamp-format", &self.timestamp_format),
            ("csv-delimiter", &self.csv_delimiter),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), v.clone())))
        .collect()
    }

    /// Field that receives the injected timestamp.
    pub fn effective_timestamp_field(&self) -> &str {
        self.timestamp_field
            .as_deref()
            .unwrap_or(DEFAULT_TIMESTAMP_FIELD)
    }
}

/// Identity of a batch. Events for different datasets or options never
/// share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub dataset: String,
    pub options: IngestOptions,
}

impl BatchKey {
    pub fn new(dataset: impl Into<String>, options: &IngestOptions) -> Self {
        Self {
            dataset: dataset.into(),
            options: options.clone(),
        }
    }
}

/// `dataset` or `dataset?name=value&...`, for logs. Equal text does not
/// imply equal keys.
impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dataset)?;
        for (i, (name, value)) in self.options.query_pairs().iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

/// Sets `field` to `now` on object events that do not have it.
pub fn inject_timestamp(event: &mut Event, field: &str, now: DateTime<Utc>) {
    if let Some(object) = event.as_object_mut() {
        if !object.contains_key(field) {
            object.insert(
                field.to_string(),
                serde_json::Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
    }
}

/// Encodes events as newline-delimited JSON.
pub fn encode_ndjson(events: &[Event]) -> Result<Bytes, serde_json::Error> {
    let mut writer = BytesMut::with_capacity(events.len() * 64).writer();
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.get_mut().put_u8(b'\n');
    }
    Ok(writer.into_inner().freeze())
}

/// Payload formats accepted by the ingest endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    NdJson,
    Csv,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::NdJson => "application/x-ndjson",
            ContentType::Csv => "text/csv",
        }
    }
}

/// Compression applied to a raw payload by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    Zstd,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Zstd => "zstd",
        }
    }
}

/// An event the server refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestFailure {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// Result of an ingest request as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestStatus {
    pub ingested: u64,
    pub failed: u64,
    pub failures: Vec<IngestFailure>,
    pub processed_bytes: u64,
    pub blocks_created: u32,
    pub wal_length: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_batch_key_without_options() {
        let key = BatchKey::new("ds-A", &IngestOptions::default());
        assert_eq!(key.to_string(), "ds-A");
    }

    #[test]
    fn test_batch_key_separates_options() {
        let plain = BatchKey::new("logs", &IngestOptions::default());
        let custom = BatchKey::new("logs", &IngestOptions::new().timestamp_field("ts"));
        let custom_fmt = BatchKey::new(
            "logs",
            &IngestOptions::new()
                .timestamp_field("ts")
                .timestamp_format("%s"),
        );

        assert_eq!(custom.to_string(), "logs?timestamp-field=ts");
        assert_eq!(
            custom_fmt.to_string(),
            "logs?timestamp-field=ts&timestamp-format=%s"
        );
        assert_ne!(plain, custom);
        assert_ne!(custom, custom_fmt);
    }

    #[test]
    fn test_batch_keys_with_same_text_stay_distinct() {
        let embedded = BatchKey::new(
            "logs",
            &IngestOptions::new().timestamp_field("ts&timestamp-format=%s"),
        );
        let separate = BatchKey::new(
            "logs",
            &IngestOptions::new()
                .timestamp_field("ts")
                .timestamp_format("%s"),
        );
        assert_eq!(embedded.to_string(), separate.to_string());
        assert_ne!(embedded, separate);

        let in_dataset = BatchKey::new("logs?timestamp-field=x", &IngestOptions::default());
        let in_options = BatchKey::new("logs", &IngestOptions::new().timestamp_field("x"));
        assert_ne!(in_dataset, in_options);
    }

    #[test]
    fn test_inject_timestamp_when_missing() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut event = json!({"foo": "bar"});

        inject_timestamp(&mut event, DEFAULT_TIMESTAMP_FIELD, now);

        assert_eq!(event["_time"], "2024-05-01T12:00:00.000Z");
        assert_eq!(event["foo"], "bar");
    }

    #[test]
    fn test_inject_timestamp_keeps_existing() {
        let now = Utc::now();
        let mut event = json!({"ts": "2020-01-01T00:00:00Z"});

        inject_timestamp(&mut event, "ts", now);
        assert_eq!(event["ts"], "2020-01-01T00:00:00Z");

        let mut scalar = json!(42);
        inject_timestamp(&mut scalar, "ts", now);
        assert_eq!(scalar, json!(42));
    }

    #[test]
    fn test_encode_ndjson_preserves_order() {
        let events = vec![json!({"foo": "bar"}), json!({"bar": "baz"})];
        let body = encode_ndjson(&events).unwrap();
        let text = std::str::from_utf8(&body).unwrap();

        assert_eq!(text, "{\"foo\":\"bar\"}\n{\"bar\":\"baz\"}\n");
        assert!(encode_ndjson(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_ingest_status_deserialization() {
        let json = r#"{
            "ingested": 2,
            "failed": 1,
            "failures": [{"timestamp": "2024-05-01T12:00:00Z", "error": "bad field"}],
            "processedBytes": 128,
            "blocksCreated": 0,
            "walLength": 3
        }"#;

        let status: IngestStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.ingested, 2);
        assert_eq!(status.failed, 1);
        assert_eq!(status.failures[0].error, "bad field");
        assert_eq!(status.processed_bytes, 128);
        assert_eq!(status.wal_length, 3);
    }

    #[test]
    fn test_ingest_status_partial_deserialization() {
        let status: IngestStatus = serde_json::from_str(r#"{"ingested": 5}"#).unwrap();
        assert_eq!(status.ingested, 5);
        assert_eq!(status.failed, 0);
        assert!(status.failures.is_empty());
    }

    #[test]
    fn test_content_headers() {
        assert_eq!(ContentType::NdJson.as_str(), "application/x-ndjson");
        assert_eq!(ContentEncoding::default(), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::Gzip.as_str(), "gzip");
    }
}
