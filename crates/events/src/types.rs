//! Message types for the relay wire protocol

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of relay message, serialized as the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Process output
    Output,
    /// Lifecycle status change
    Status,
    /// Fatal condition reported before teardown
    Error,
}

/// Value of the `status` attribute on status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Waiting,
    Started,
    Starting,
    Connected,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Waiting => "waiting",
            RunStatus::Started => "started",
            RunStatus::Starting => "starting",
            RunStatus::Connected => "connected",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

/// Machine-readable `code` attribute on error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The source never appeared within the wait timeout
    Timeout,
    /// Reading the source failed mid-stream
    StreamError,
    /// The process could not be started
    SpawnError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::SpawnError => "SPAWN_ERROR",
        }
    }
}

/// A single relay message.
///
/// Serialized as `{"type": ..., "data": ..., "timestamp": ...}` with the
/// kind-specific attributes flattened into the same object. Messages are
/// built with the consuming `with_*` methods and are not mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: MessageKind,
    data: String,
    timestamp: f64,
    #[serde(flatten)]
    attributes: Map<String, Value>,
}

impl Message {
    /// Create a message stamped with the current wall-clock time
    pub fn new(kind: MessageKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            timestamp: unix_timestamp(),
            attributes: Map::new(),
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        Self::new(MessageKind::Output, data)
    }

    pub fn status(status: RunStatus) -> Self {
        Self::new(MessageKind::Status, "").with("status", status.as_str())
    }

    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::new(MessageKind::Error, "")
            .with("message", message.into())
            .with("code", code.as_str())
    }

    /// Attach a kind-specific attribute
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Attach an attribute only when a value is present
    pub fn with_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// The `status` attribute, for status messages
    pub fn status_value(&self) -> Option<&str> {
        self.attribute("status").and_then(Value::as_str)
    }

    /// The `exit_code` attribute, when present
    pub fn exit_code(&self) -> Option<i64> {
        self.attribute("exit_code").and_then(Value::as_i64)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Seconds since the Unix epoch with sub-second precision
fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_message_serialize() {
        let msg = Message::output("\x1b[32mhello\x1b[0m");
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "output");
        assert_eq!(json["data"], "\x1b[32mhello\x1b[0m");
        assert!(json["timestamp"].as_f64().unwrap() > 1_600_000_000.0);
    }

    #[test]
    fn test_status_attributes_are_flattened() {
        let msg = Message::status(RunStatus::Completed)
            .with("exit_code", 7)
            .with("lines_sent", 42);
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "status");
        assert_eq!(json["data"], "");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["exit_code"], 7);
        assert_eq!(json["lines_sent"], 42);
    }

    #[test]
    fn test_error_message_carries_code() {
        let msg = Message::error("Timeout waiting for log file: /shared/out", ErrorCode::Timeout);

        assert_eq!(msg.kind(), MessageKind::Error);
        assert_eq!(msg.attribute("code").unwrap(), "TIMEOUT");
        assert_eq!(
            msg.attribute("message").unwrap(),
            "Timeout waiting for log file: /shared/out"
        );
    }

    #[test]
    fn test_with_opt_skips_missing_values() {
        let msg = Message::status(RunStatus::Completed).with_opt::<i32>("exit_code", None);
        assert!(msg.exit_code().is_none());

        let msg = Message::status(RunStatus::Completed).with_opt("exit_code", Some(3));
        assert_eq!(msg.exit_code(), Some(3));
    }

    #[test]
    fn test_deserialize_collects_unknown_keys_as_attributes() {
        let json = r#"{"type":"status","data":"","timestamp":1.5,"status":"started","pid":4242}"#;
        let msg: Message = serde_json::from_str(json).unwrap();

        assert_eq!(msg.kind(), MessageKind::Status);
        assert_eq!(msg.status_value(), Some("started"));
        assert_eq!(msg.attribute("pid").and_then(Value::as_i64), Some(4242));
        assert_eq!(msg.timestamp(), 1.5);
    }

    #[test]
    fn test_timestamps_do_not_go_backwards() {
        let first = Message::output("a");
        let second = Message::output("b");
        assert!(second.timestamp() >= first.timestamp());
    }
}
