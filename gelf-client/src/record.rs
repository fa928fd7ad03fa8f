//! GELF record construction.
//!
//! A record is a JSON document in the GELF 1.1 schema: `version`, `host`,
//! `timestamp`, a severity `level`, and either a single `message` or a
//! `short_message`/`full_message` pair. User-defined fields are carried with
//! a `_` prefix; the `_id` field is reserved by Graylog and stripped.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{ClientError, Result};

/// GELF schema revision stamped into every record.
pub const GELF_VERSION: &str = "1.1";

/// Map a severity name to its numeric level.
///
/// Returns `None` for names outside the alias table.
pub fn parse_level(name: &str) -> Option<u8> {
    match name.to_ascii_lowercase().as_str() {
        "fatal" | "emerg" | "emergency" => Some(1),
        "alert" => Some(2),
        "crit" | "critical" => Some(3),
        "error" | "err" => Some(4),
        "warn" | "warning" => Some(5),
        "note" | "notice" => Some(6),
        "info" => Some(7),
        "debug" => Some(8),
        "trace" | "core" => Some(9),
        _ => None,
    }
}

/// Event time of a record.
///
/// Producers either already hold a numeric epoch (log line parsers) or a
/// structured date value (cron wrappers); both normalize to a numeric string
/// in the emitted document so downstream JSON consumers never see a float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestamp {
    /// Seconds since the Unix epoch
    Epoch(f64),
    /// A structured wall-clock instant
    Structured(DateTime<Utc>),
}

impl Timestamp {
    fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Timestamp::Epoch(secs)
    }

    /// Render as the numeric string carried on the wire.
    fn to_numeric_string(self) -> String {
        match self {
            Timestamp::Epoch(secs) => format!("{}", secs),
            Timestamp::Structured(dt) => {
                let millis = dt.timestamp_millis();
                if millis % 1000 == 0 {
                    format!("{}", millis / 1000)
                } else {
                    format!("{}", millis as f64 / 1000.0)
                }
            }
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp::Structured(dt)
    }
}

impl From<f64> for Timestamp {
    fn from(secs: f64) -> Self {
        Timestamp::Epoch(secs)
    }
}

/// A finished GELF document, ready for the wire.
#[derive(Debug, Clone)]
pub struct Record {
    doc: Map<String, Value>,
}

impl Record {
    /// The underlying JSON object.
    pub fn as_json(&self) -> &Map<String, Value> {
        &self.doc
    }

    /// Serialize to the byte payload shipped inside a datagram.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.doc)?)
    }
}

/// Builder for [`Record`]
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    host: Option<String>,
    timestamp: Option<Timestamp>,
    level: Option<u8>,
    facility: Option<String>,
    message: Option<String>,
    short_message: Option<String>,
    full_message: Option<String>,
    fields: Vec<(String, Value)>,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source host. Defaults to the system hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Event time. Defaults to the current wall clock.
    pub fn timestamp(mut self, ts: impl Into<Timestamp>) -> Self {
        self.timestamp = Some(ts.into());
        self
    }

    /// Numeric severity, 1 (fatal) through 9 (trace).
    pub fn level(mut self, level: u8) -> Result<Self> {
        if !(1..=9).contains(&level) {
            return Err(ClientError::LevelOutOfRange(level as i64));
        }
        self.level = Some(level);
        Ok(self)
    }

    /// Severity by name, through the alias table.
    pub fn level_name(mut self, name: &str) -> Result<Self> {
        match parse_level(name) {
            Some(level) => {
                self.level = Some(level);
                Ok(self)
            }
            None => Err(ClientError::UnknownLevel(name.to_string())),
        }
    }

    /// Originating facility, e.g. the wrapping tool's name.
    pub fn facility(mut self, facility: impl Into<String>) -> Self {
        self.facility = Some(facility.into());
        self
    }

    /// The log message. A message containing a newline is split at the
    /// first one into `short_message` and `full_message`.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Explicit one-line summary; suppresses the `message` key.
    pub fn short_message(mut self, short: impl Into<String>) -> Self {
        self.short_message = Some(short.into());
        self
    }

    /// Explicit long form accompanying [`short_message`](Self::short_message).
    pub fn full_message(mut self, full: impl Into<String>) -> Self {
        self.full_message = Some(full.into());
        self
    }

    /// Attach a user-defined field. The key is prefixed with `_` on the
    /// wire; the reserved `_id` field is stripped.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Assemble the document.
    pub fn build(self) -> Result<Record> {
        let mut doc = Map::new();
        doc.insert("version".into(), Value::String(GELF_VERSION.into()));

        let host = match self.host {
            Some(h) => h,
            None => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
        };
        doc.insert("host".into(), Value::String(host));

        let ts = self.timestamp.unwrap_or_else(Timestamp::now);
        doc.insert("timestamp".into(), Value::String(ts.to_numeric_string()));

        doc.insert(
            "level".into(),
            Value::Number(self.level.unwrap_or(7).into()),
        );

        if let Some(facility) = self.facility {
            doc.insert("facility".into(), Value::String(facility));
        }

        match (self.short_message, self.message) {
            (Some(short), _) => {
                doc.insert("short_message".into(), Value::String(short));
                if let Some(full) = self.full_message {
                    doc.insert("full_message".into(), Value::String(full));
                }
            }
            (None, Some(message)) => match message.split_once('\n') {
                Some((first, rest)) => {
                    doc.insert("short_message".into(), Value::String(first.to_string()));
                    doc.insert("full_message".into(), Value::String(rest.to_string()));
                }
                None => {
                    doc.insert("message".into(), Value::String(message));
                }
            },
            (None, None) => return Err(ClientError::MessageMissing),
        }

        for (key, value) in self.fields {
            let key = if key.starts_with('_') {
                key
            } else {
                format!("_{}", key)
            };
            // _id is reserved by Graylog and must never reach the wire.
            if key == "_id" {
                continue;
            }
            doc.insert(key, value);
        }

        Ok(Record { doc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn epoch_now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
    }

    #[test]
    fn hello_world_record() {
        let before = epoch_now();
        let record = RecordBuilder::new()
            .message("hej")
            .level_name("info")
            .unwrap()
            .build()
            .unwrap();
        let after = epoch_now();

        let doc = record.as_json();
        assert_eq!(doc["version"], "1.1");
        assert_eq!(doc["level"], 7);
        assert_eq!(doc["message"], "hej");
        let expected_host = hostname::get().unwrap().to_string_lossy().into_owned();
        assert_eq!(doc["host"], Value::String(expected_host));

        let ts: f64 = doc["timestamp"].as_str().unwrap().parse().unwrap();
        assert!(ts >= before && ts <= after);
    }

    #[test]
    fn user_fields_are_prefixed() {
        let record = RecordBuilder::new()
            .message("hej")
            .field("foo", 123)
            .field("bar", 456)
            .build()
            .unwrap();
        let doc = record.as_json();
        assert_eq!(doc["_foo"], 123);
        assert_eq!(doc["_bar"], 456);
        assert!(!doc.contains_key("foo"));
        assert!(!doc.contains_key("bar"));
    }

    #[test]
    fn reserved_id_field_is_stripped() {
        let record = RecordBuilder::new()
            .message("x")
            .field("id", "abc")
            .field("_id", "def")
            .build()
            .unwrap();
        assert!(!record.as_json().contains_key("_id"));
        assert!(!record.as_json().contains_key("id"));
    }

    #[test]
    fn multiline_message_splits_at_first_newline() {
        let record = RecordBuilder::new().message("a\nb\nc").build().unwrap();
        let doc = record.as_json();
        assert_eq!(doc["short_message"], "a");
        assert_eq!(doc["full_message"], "b\nc");
        assert!(!doc.contains_key("message"));
    }

    #[test]
    fn explicit_short_and_full_pass_through() {
        let record = RecordBuilder::new()
            .short_message("s")
            .full_message("f")
            .build()
            .unwrap();
        let doc = record.as_json();
        assert_eq!(doc["short_message"], "s");
        assert_eq!(doc["full_message"], "f");
    }

    #[test]
    fn level_alias_table() {
        for (names, expected) in [
            (&["fatal", "emerg", "emergency"][..], 1),
            (&["alert"][..], 2),
            (&["crit", "critical"][..], 3),
            (&["error", "err"][..], 4),
            (&["warn", "warning"][..], 5),
            (&["note", "notice"][..], 6),
            (&["info"][..], 7),
            (&["debug"][..], 8),
            (&["trace", "core"][..], 9),
        ] {
            for name in names {
                assert_eq!(parse_level(name), Some(expected), "alias {}", name);
            }
        }
        assert_eq!(parse_level("bogus"), None);
    }

    #[test]
    fn level_out_of_range_rejected() {
        assert!(RecordBuilder::new().level(0).is_err());
        assert!(RecordBuilder::new().level(10).is_err());
        assert!(RecordBuilder::new().level(9).is_ok());
    }

    #[test]
    fn structured_timestamp_normalizes_to_numeric_string() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = RecordBuilder::new()
            .message("x")
            .timestamp(dt)
            .build()
            .unwrap();
        let ts = record.as_json()["timestamp"].as_str().unwrap().to_string();
        assert_eq!(ts, dt.timestamp().to_string());
    }

    #[test]
    fn missing_message_is_an_error() {
        assert!(matches!(
            RecordBuilder::new().build(),
            Err(ClientError::MessageMissing)
        ));
    }
}
