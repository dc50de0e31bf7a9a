//! Wire record to typed event decoding
//!
//! Socket messages and events-file lines both end up here. Decoding never
//! fails: a payload that does not fit its kind becomes
//! [`EventKind::Generic`] with the raw data attached.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::types::{Event, EventKind, EventType, GenericEvent};

/// Type name used when a record carries none
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Build a typed event from its type name, task ID, timestamp and payload
pub fn decode(event_type: &str, task_id: &str, timestamp: DateTime<Utc>, data: Value) -> Event {
    let kind = match EventType::parse(event_type) {
        EventType::TaskStarted => payload(&data).map(EventKind::TaskStarted),
        EventType::TaskProgress => payload(&data).map(EventKind::TaskProgress),
        EventType::TaskCompleted => payload(&data).map(EventKind::TaskCompleted),
        EventType::TaskFailed => payload(&data).map(EventKind::TaskFailed),
        EventType::OrchestratorStarted => payload(&data).map(EventKind::OrchestratorStarted),
        EventType::OrchestratorCompleted => payload(&data).map(EventKind::OrchestratorCompleted),
        EventType::OrchestratorFailed => payload(&data).map(EventKind::OrchestratorFailed),
        EventType::AdapterValidation => payload(&data).map(EventKind::AdapterValidation),
        EventType::AdapterPromptLoad => payload(&data).map(EventKind::AdapterPromptLoad),
        EventType::AdapterExecution => payload(&data).map(EventKind::AdapterExecution),
        EventType::Other(_) => None,
    };

    let task_id = if task_id.is_empty() {
        string_field(&data, &["task_id", "id"]).unwrap_or_default()
    } else {
        task_id.to_string()
    };

    let kind = kind.unwrap_or_else(|| {
        debug!(event_type, %task_id, "decode: falling back to generic event");
        EventKind::Generic(GenericEvent {
            event_type: event_type.to_string(),
            data,
        })
    });

    Event::with_timestamp(task_id, timestamp, kind)
}

/// Decode a JSON record from an events file
///
/// Two shapes are accepted. An envelope (`{"type", "task_id", "timestamp",
/// "data": {...}}`) is recognised by an object-valued `data` field. Anything
/// else is a flat record whose type comes from `event_type` or `type` and
/// whose task ID comes from `task_id` or `id`. Returns `None` only when the
/// record is not a JSON object.
pub fn decode_record(record: Value) -> Option<Event> {
    if !record.is_object() {
        return None;
    }

    if record.get("data").is_some_and(Value::is_object) {
        let event_type = string_field(&record, &["type", "event_type"]).unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string());
        let task_id = string_field(&record, &["task_id", "id"]).unwrap_or_default();
        let timestamp = record.get("timestamp").and_then(parse_timestamp).unwrap_or_else(Utc::now);
        let data = record.get("data").cloned().unwrap_or(Value::Null);
        return Some(decode(&event_type, &task_id, timestamp, data));
    }

    let event_type = string_field(&record, &["event_type", "type"]).unwrap_or_else(|| UNKNOWN_EVENT_TYPE.to_string());
    let task_id = string_field(&record, &["task_id", "id"]).unwrap_or_default();
    let timestamp = record.get("timestamp").and_then(parse_timestamp).unwrap_or_else(Utc::now);
    Some(decode(&event_type, &task_id, timestamp, record))
}

fn payload<T: DeserializeOwned>(data: &Value) -> Option<T> {
    if !data.is_object() {
        return None;
    }
    serde_json::from_value(data.clone()).ok()
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Read a timestamp from a JSON value
///
/// Strings may be RFC 3339, RFC 2822, or a naive ISO date-time (with `T` or a
/// space, taken as UTC). Numbers are Unix seconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9) as u32;
            Utc.timestamp_opt(whole as i64, nanos).single()
        }
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}
