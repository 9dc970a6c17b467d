// Wire conversions between remote store documents and domain models
// Timestamps arrive in several shapes and are normalized to DateTime<Utc> here

use chrono::{DateTime, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::StoreError;
use crate::models::{Chat, Direction, Message, Status, DEFAULT_AVATAR_URL};
use crate::store::{Document, Fields, Patch};

static TIME_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?$").expect("valid time-only regex"));

/// Epoch numbers at or above this magnitude are milliseconds, below it seconds
const MILLIS_THRESHOLD: f64 = 1e11;

/// Normalize any accepted timestamp shape into a UTC instant.
///
/// Accepts ISO-8601/RFC 3339 strings, epoch numbers (seconds or milliseconds),
/// `{seconds, nanoseconds}` objects and legacy "HH:MM[:SS]" strings (today, UTC).
/// Anything else yields `None`.
pub fn normalize_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_timestamp_str(text),
        Value::Number(number) => from_epoch(number.as_f64()?),
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if nanos >= 1_000_000_000 {
                return None;
            }
            Utc.timestamp_opt(seconds, nanos as u32).single()
        }
        _ => None,
    }
}

fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }

    // ISO without offset is taken as UTC
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Some(caps) = TIME_ONLY.captures(text) {
        let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minute: u32 = caps.get(2)?.as_str().parse().ok()?;
        let second: u32 = caps.get(3).map_or(Some(0), |s| s.as_str().parse().ok())?;
        let time = NaiveTime::from_hms_opt(hour, minute, second)?;
        let today = Utc::now().date_naive();
        return Some(Utc.from_utc_datetime(&today.and_time(time)));
    }

    text.parse::<f64>().ok().and_then(from_epoch)
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() >= MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

/// Encode an instant the way the remote store encodes server timestamps
pub fn timestamp_to_value(time: &DateTime<Utc>) -> Value {
    json!({
        "seconds": time.timestamp(),
        "nanoseconds": time.timestamp_subsec_nanos(),
    })
}

/// Serde adapter: writes RFC 3339, reads any accepted timestamp shape
pub mod flexible_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        super::normalize_timestamp(&value)
            .ok_or_else(|| D::Error::custom(format!("unrecognized timestamp: {}", value)))
    }
}

/// Serde adapter for optional timestamps. Null or unrecognized input becomes `None`.
pub mod flexible_timestamp_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(
        time: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(time) => super::flexible_timestamp::serialize(time, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(super::normalize_timestamp(&value))
    }
}

fn to_fields<T: serde::Serialize>(value: &T) -> Fields {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!("Expected an object when encoding a record, got {}", other);
            Fields::new()
        }
        Err(e) => {
            warn!("Failed to encode record: {}", e);
            Fields::new()
        }
    }
}

fn with_id(doc: &Document) -> Value {
    let mut fields = doc.fields.clone();
    fields.insert("id".to_string(), Value::String(doc.id.clone()));
    Value::Object(fields)
}

pub fn chat_from_document(doc: &Document) -> Result<Chat, StoreError> {
    let mut value = with_id(doc);
    if let Value::Object(fields) = &mut value {
        // Messages live in their own collection
        fields.remove("messages");
        // Prefer current field names when a record carries both
        for (current, legacy) in [("unreadCount", "unread"), ("avatarUrl", "avatar")] {
            if fields.contains_key(current) {
                fields.remove(legacy);
            }
        }
    }

    let mut chat: Chat = serde_json::from_value(value)
        .map_err(|e| StoreError::InvalidData(format!("chat {}: {}", doc.id, e)))?;
    if chat.avatar_url.is_empty() {
        chat.avatar_url = DEFAULT_AVATAR_URL.to_string();
    }
    Ok(chat)
}

/// Chat metadata as a plain record (no id, no messages)
pub fn chat_to_fields(chat: &Chat) -> Fields {
    let mut fields = to_fields(&chat.without_messages());
    fields.remove("id");
    fields.remove("messages");
    fields
}

pub fn message_from_document(doc: &Document) -> Result<Message, StoreError> {
    let mut value = with_id(doc);
    if let Value::Object(fields) = &mut value {
        if !fields.contains_key("direction") {
            let direction = legacy_direction(fields);
            fields.insert("direction".to_string(), json!(direction));
        }
        fields.remove("isOutgoing");
        fields.remove("sent");
    }

    serde_json::from_value(value)
        .map_err(|e| StoreError::InvalidData(format!("message {}: {}", doc.id, e)))
}

/// Older records carry `isOutgoing` (admin view) or `sent` (user view) instead of `direction`
fn legacy_direction(fields: &Fields) -> Direction {
    if let Some(outgoing) = fields.get("isOutgoing").and_then(Value::as_bool) {
        return if outgoing { Direction::Outgoing } else { Direction::Incoming };
    }
    if let Some(sent_by_user) = fields.get("sent").and_then(Value::as_bool) {
        return if sent_by_user { Direction::Incoming } else { Direction::Outgoing };
    }
    Direction::Outgoing
}

pub fn message_to_fields(message: &Message) -> Fields {
    let mut fields = to_fields(message);
    fields.remove("id");
    fields
}

/// Insert patch for a new message; the timestamp is assigned by the server
pub fn message_insert_patch(message: &Message) -> Patch {
    let mut fields = message_to_fields(message);
    fields.remove("timestamp");
    Patch::from_fields(fields).server_timestamp("timestamp")
}

/// Convert a page of documents, skipping records that fail to decode
pub fn messages_from_documents(docs: &[Document]) -> Vec<Message> {
    docs.iter()
        .filter_map(|doc| match message_from_document(doc) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping malformed message document: {}", e);
                None
            }
        })
        .collect()
}

pub fn status_from_document(doc: &Document) -> Result<Status, StoreError> {
    serde_json::from_value(with_id(doc))
        .map_err(|e| StoreError::InvalidData(format!("status {}: {}", doc.id, e)))
}

/// RFC 3339 rendering used in log lines and the demo output
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}
