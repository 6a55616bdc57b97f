//! Uniform request/response envelope exchanged between services.
//!
//! Requests are JSON objects carrying an `"Action"` member. Every response is
//! a [`ReturnMessage`]: `{ "Status": "Ok" | "Failed", "What": <string>,
//! "Values"?: <object> }`.

use serde_json::{json, Map, Value};
use std::fmt;

/// Member naming the action of an outbound document.
pub const ACTION_MEMBER: &str = "Action";

/// Well-known action names.
pub mod action {
    pub const PING: &str = "Ping";
    pub const INIT: &str = "Init";
    pub const ECHO: &str = "Echo";
    pub const EXIT: &str = "Exit";
    pub const SERVICE_CONNECTED: &str = "ServiceConnected";
    pub const SERVICE_DISCONNECTED: &str = "ServiceDisconnected";
    pub const SERVICE_PRE_SHUTDOWN: &str = "ServicePreShutdown";
    pub const SERVICE_SHUTDOWN: &str = "ServiceShutdown";
    pub const SERVICE_EMERGENCY_SHUTDOWN: &str = "ServiceEmergencyShutdown";
}

/// Well-known parameter members.
pub mod param {
    pub const VALUE: &str = "Value";
    pub const SERVICE_ID: &str = "ServiceID";
    pub const SERVICE_URL: &str = "ServiceURL";
    pub const SERVICE_NAME: &str = "ServiceName";
    pub const SERVICE_TYPE: &str = "ServiceType";
    pub const SESSION_EXISTS: &str = "SessionExists";
}

const STATUS_MEMBER: &str = "Status";
const WHAT_MEMBER: &str = "What";
const VALUES_MEMBER: &str = "Values";

/// Build a document containing only an `"Action"` member.
pub fn action_document(name: &str) -> Value {
    json!({ ACTION_MEMBER: name })
}

/// Return the action name of a request document, if it has one.
pub fn action_of(document: &Value) -> Option<&str> {
    document.get(ACTION_MEMBER).and_then(Value::as_str)
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Failed => "Failed",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Ok" => Some(Status::Ok),
            "Failed" => Some(Status::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable response envelope.
///
/// `What` carries either an error description or the serialized result of a
/// successful action. `Values` holds optional named result entries and is
/// left out of the JSON form entirely when empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReturnMessage {
    status: Status,
    what: String,
    values: Map<String, Value>,
}

impl ReturnMessage {
    pub fn new(status: Status, what: impl Into<String>) -> Self {
        Self {
            status,
            what: what.into(),
            values: Map::new(),
        }
    }

    pub fn ok(what: impl Into<String>) -> Self {
        Self::new(Status::Ok, what)
    }

    pub fn failed(what: impl Into<String>) -> Self {
        Self::new(Status::Failed, what)
    }

    /// Attach a named result entry.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn what(&self) -> &str {
        &self.what
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Parse a response document. Never fails: malformed input produces a
    /// `Failed` message describing the problem, and empty input is an `Ok`
    /// message without payload.
    pub fn from_json(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::ok("");
        }
        Self::parse(text).unwrap_or_else(|reason| {
            tracing::debug!(%reason, "unusable return message");
            Self::failed(reason)
        })
    }

    /// Build a message from an already-parsed JSON value.
    pub fn from_value(value: &Value) -> Self {
        Self::parse_value(value).unwrap_or_else(Self::failed)
    }

    /// Strict form of [`from_json`](Self::from_json): the text must be a JSON
    /// object with string `Status` and `What` members.
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| format!("Invalid JSON: {e}"))?;
        Self::parse_value(&value)
    }

    pub fn parse_value(value: &Value) -> Result<Self, String> {
        let Some(object) = value.as_object() else {
            return Err("Invalid return message: expected a JSON object".into());
        };

        let status = match object.get(STATUS_MEMBER) {
            Some(Value::String(s)) => match Status::parse(s) {
                Some(status) => status,
                None => {
                    tracing::warn!(status = %s, "unknown return status, treating as Failed");
                    Status::Failed
                }
            },
            Some(_) => return Err("Invalid return message: \"Status\" is not a string".into()),
            None => return Err("Invalid return message: missing \"Status\"".into()),
        };

        let what = match object.get(WHAT_MEMBER) {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err("Invalid return message: \"What\" is not a string".into()),
            None => return Err("Invalid return message: missing \"What\"".into()),
        };

        let values = match object.get(VALUES_MEMBER) {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err("Invalid return message: \"Values\" is not an object".into()),
            None => Map::new(),
        };

        Ok(Self {
            status,
            what,
            values,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(STATUS_MEMBER.into(), Value::String(self.status.as_str().into()));
        object.insert(WHAT_MEMBER.into(), Value::String(self.what.clone()));
        if !self.values.is_empty() {
            object.insert(VALUES_MEMBER.into(), Value::Object(self.values.clone()));
        }
        Value::Object(object)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

impl fmt::Display for ReturnMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_ok_without_payload() {
        let msg = ReturnMessage::from_json("");
        assert_eq!(msg.status(), Status::Ok);
        assert_eq!(msg.what(), "");
        assert!(msg.values().is_empty());

        let msg = ReturnMessage::from_json("   \n");
        assert!(msg.is_ok());
    }

    #[test]
    fn malformed_json_fails_with_explanation() {
        let msg = ReturnMessage::from_json("{not json");
        assert_eq!(msg.status(), Status::Failed);
        assert!(msg.what().starts_with("Invalid JSON"), "got: {}", msg.what());
    }

    #[test]
    fn non_object_fails() {
        let msg = ReturnMessage::from_json("[1, 2, 3]");
        assert_eq!(msg.status(), Status::Failed);
        assert!(msg.what().contains("expected a JSON object"));
    }

    #[test]
    fn unknown_status_fails_closed() {
        let msg = ReturnMessage::from_json(r#"{"Status":"Maybe","What":"x"}"#);
        assert_eq!(msg.status(), Status::Failed);
        assert_eq!(msg.what(), "x");
    }

    #[test]
    fn missing_required_members_fail() {
        assert!(!ReturnMessage::from_json(r#"{"What":"x"}"#).is_ok());
        assert!(!ReturnMessage::from_json(r#"{"Status":"Ok"}"#).is_ok());
        assert!(!ReturnMessage::from_json(r#"{"Status":"Ok","What":3}"#).is_ok());
    }

    #[test]
    fn strict_parse_rejects_what_from_json_tolerates() {
        assert!(ReturnMessage::parse("").is_err());
        assert!(ReturnMessage::parse("{not json").unwrap_err().starts_with("Invalid JSON"));
        assert!(ReturnMessage::parse("\"Ok\"").is_err());
        assert!(ReturnMessage::parse(r#"{"Status":"Ok"}"#).is_err());
        assert_eq!(
            ReturnMessage::parse(r#"{"Status":"Failed","What":"no"}"#),
            Ok(ReturnMessage::failed("no"))
        );
    }

    #[test]
    fn parses_values() {
        let msg = ReturnMessage::from_json(
            r#"{"Status":"Ok","What":"done","Values":{"count":3,"name":"a"}}"#,
        );
        assert!(msg.is_ok());
        assert_eq!(msg.value("count"), Some(&json!(3)));
        assert_eq!(msg.value("name"), Some(&json!("a")));
    }

    #[test]
    fn empty_values_are_omitted() {
        let text = ReturnMessage::ok("hi").to_json();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"Status": "Ok", "What": "hi"}));
        assert!(!text.contains("Values"));
    }

    #[test]
    fn round_trip_preserves_message() {
        let messages = [
            ReturnMessage::ok(""),
            ReturnMessage::ok("hi"),
            ReturnMessage::failed("boom: \"quoted\"\nnext line"),
            ReturnMessage::ok(r#"{"nested":"payload"}"#)
                .with_value("a", json!(1))
                .with_value("b", json!({"deep": [true, null]})),
        ];
        for m in messages {
            assert_eq!(ReturnMessage::from_json(&m.to_json()), m);
        }
    }

    #[test]
    fn serialized_form_is_newline_free() {
        let m = ReturnMessage::failed("line one\nline two");
        assert!(!m.to_json().contains('\n'));
    }

    #[test]
    fn action_helpers() {
        let doc = action_document(action::PING);
        assert_eq!(doc, json!({"Action": "Ping"}));
        assert_eq!(action_of(&doc), Some("Ping"));
        assert_eq!(action_of(&json!({"Value": 1})), None);
    }
}
