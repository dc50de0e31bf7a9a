//! IPC message types
//!
//! Every line on the monitor socket is one JSON [`IpcMessage`] followed by a
//! newline. Event messages carry the event's type name and its flat data. Two
//! control types exist: a viewer's history `request`, and the server's
//! `replay` batch answering it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::events::{Event, decode, parse_timestamp};

/// Message type a viewer sends to ask for history
pub const REQUEST: &str = "request";

/// Message type of the server's history batch
pub const REPLAY: &str = "replay";

/// One line on the monitor socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    #[serde(rename = "type")]
    pub message_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,

    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub data: Value,
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value).unwrap_or_else(Utc::now))
}

impl IpcMessage {
    /// Wrap an event for the wire
    pub fn from_event(event: &Event) -> Self {
        Self {
            message_type: event.type_name().to_string(),
            task_id: event.task_id.clone(),
            timestamp: event.timestamp,
            data: event.to_data(),
        }
    }

    /// The viewer handshake: `{"type":"request","data":{"request":"history"}}`
    pub fn history_request() -> Self {
        Self {
            message_type: REQUEST.to_string(),
            task_id: String::new(),
            timestamp: Utc::now(),
            data: json!({ "request": "history" }),
        }
    }

    /// A history batch, oldest first
    pub fn replay(history: &[IpcMessage]) -> Self {
        Self {
            message_type: REPLAY.to_string(),
            task_id: String::new(),
            timestamp: Utc::now(),
            data: json!({ "events": history, "count": history.len() }),
        }
    }

    pub fn is_history_request(&self) -> bool {
        self.message_type == REQUEST && self.data.get("request").and_then(Value::as_str) == Some("history")
    }

    pub fn is_replay(&self) -> bool {
        self.message_type == REPLAY
    }

    /// Entries of a replay batch; malformed entries are skipped
    pub fn replay_entries(&self) -> Vec<IpcMessage> {
        let Some(entries) = self.data.get("events").and_then(Value::as_array) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "IpcMessage::replay_entries: skipping malformed entry");
                    None
                }
            })
            .collect()
    }

    /// Decode into a typed event; never fails
    pub fn to_event(&self) -> Event {
        decode(&self.message_type, &self.task_id, self.timestamp, self.data.clone())
    }

    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
