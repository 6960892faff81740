use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chat::TerminalStatus;

/// A protocol record exchanged on the control channel.
///
/// Always a JSON object carrying a `type` discriminator. Middleware may
/// replace events wholesale, so the payload stays schemaless.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireEvent(Value);

impl WireEvent {
    /// Wrap an arbitrary JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// An event carrying only a `type` field.
    pub fn typed(kind: &str) -> Self {
        let mut map = Map::new();
        let _ = map.insert("type".into(), Value::String(kind.to_string()));
        Self(Value::Object(map))
    }

    /// Parse inbound channel text. Non-object JSON is rejected.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "expected a JSON object",
            ));
        }
        Ok(Self(value))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    /// The `type` discriminator, if present.
    pub fn kind(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Set a top-level field. No-op when the event is not an object.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.0 {
            let _ = map.insert(key.to_string(), value);
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for WireEvent {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Which output stream an assistant delta belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantChannel {
    /// Transcript of spoken audio output.
    AudioTranscript,
    Text,
}

/// Origin of a semantic `error` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScope {
    /// The backend sent a top-level `error` event.
    Server,
    /// A tool call could not be decoded.
    Tool,
}

/// Normalized, application-level events emitted by the router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SemanticEvent {
    #[serde(rename = "user:item_started")]
    UserItemStarted { item_id: String },

    #[serde(rename = "user:delta")]
    UserDelta { item_id: String, delta: String },

    #[serde(rename = "user:completed")]
    UserCompleted { item_id: String, transcript: String },

    #[serde(rename = "user:failed")]
    UserFailed {
        item_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "user:truncated")]
    UserTruncated { item_id: String },

    #[serde(rename = "assistant:response_started")]
    AssistantResponseStarted { response_id: String },

    #[serde(rename = "assistant:delta")]
    AssistantDelta {
        response_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        channel: AssistantChannel,
        delta: String,
    },

    #[serde(rename = "assistant:completed")]
    AssistantCompleted {
        response_id: String,
        status: TerminalStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    #[serde(rename = "tool:call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    #[serde(rename = "tool:call_done")]
    ToolCallDone {
        call_id: String,
        name: String,
        args: Value,
    },

    #[serde(rename = "error")]
    Error {
        scope: ErrorScope,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<Value>,
    },
}

impl SemanticEvent {
    pub fn kind(&self) -> SemanticKind {
        match self {
            Self::UserItemStarted { .. } => SemanticKind::UserItemStarted,
            Self::UserDelta { .. } => SemanticKind::UserDelta,
            Self::UserCompleted { .. } => SemanticKind::UserCompleted,
            Self::UserFailed { .. } => SemanticKind::UserFailed,
            Self::UserTruncated { .. } => SemanticKind::UserTruncated,
            Self::AssistantResponseStarted { .. } => SemanticKind::AssistantResponseStarted,
            Self::AssistantDelta { .. } => SemanticKind::AssistantDelta,
            Self::AssistantCompleted { .. } => SemanticKind::AssistantCompleted,
            Self::ToolCallDelta { .. } => SemanticKind::ToolCallDelta,
            Self::ToolCallDone { .. } => SemanticKind::ToolCallDone,
            Self::Error { .. } => SemanticKind::Error,
        }
    }
}

/// Discriminant of [`SemanticEvent`], used as the listener registry key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SemanticKind {
    UserItemStarted,
    UserDelta,
    UserCompleted,
    UserFailed,
    UserTruncated,
    AssistantResponseStarted,
    AssistantDelta,
    AssistantCompleted,
    ToolCallDelta,
    ToolCallDone,
    Error,
}

impl SemanticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserItemStarted => "user:item_started",
            Self::UserDelta => "user:delta",
            Self::UserCompleted => "user:completed",
            Self::UserFailed => "user:failed",
            Self::UserTruncated => "user:truncated",
            Self::AssistantResponseStarted => "assistant:response_started",
            Self::AssistantDelta => "assistant:delta",
            Self::AssistantCompleted => "assistant:completed",
            Self::ToolCallDelta => "tool:call_delta",
            Self::ToolCallDone => "tool:call_done",
            Self::Error => "error",
        }
    }

    pub fn all() -> &'static [SemanticKind] {
        &[
            Self::UserItemStarted,
            Self::UserDelta,
            Self::UserCompleted,
            Self::UserFailed,
            Self::UserTruncated,
            Self::AssistantResponseStarted,
            Self::AssistantDelta,
            Self::AssistantCompleted,
            Self::ToolCallDelta,
            Self::ToolCallDone,
            Self::Error,
        ]
    }
}

impl fmt::Display for SemanticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no semantic event.
#[derive(Debug, thiserror::Error)]
#[error("unknown semantic event type: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for SemanticKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_object_event() {
        let evt = WireEvent::parse(r#"{"type":"response.created","response":{"id":"resp_1"}}"#)
            .unwrap();
        assert_eq!(evt.kind(), Some("response.created"));
        assert_eq!(evt.get("response").unwrap()["id"], "resp_1");
    }

    #[test]
    fn parse_rejects_malformed_text() {
        assert!(WireEvent::parse("{not json").is_err());
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(WireEvent::parse("42").is_err());
        assert!(WireEvent::parse(r#"["type"]"#).is_err());
    }

    #[test]
    fn typed_event_serializes_type_only() {
        let evt = WireEvent::typed("response.cancel");
        assert_eq!(evt.to_text().unwrap(), r#"{"type":"response.cancel"}"#);
    }

    #[test]
    fn set_overwrites_field() {
        let mut evt = WireEvent::typed("x");
        evt.set("event_id", json!("evt_1"));
        assert_eq!(evt.str_field("event_id"), Some("evt_1"));
    }

    #[test]
    fn semantic_event_wire_tag() {
        let evt = SemanticEvent::AssistantDelta {
            response_id: "resp_1".into(),
            item_id: None,
            channel: AssistantChannel::AudioTranscript,
            delta: "Hi".into(),
        };
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value["type"], "assistant:delta");
        assert_eq!(value["channel"], "audio_transcript");
        assert!(value.get("item_id").is_none());
    }

    #[test]
    fn kind_matches_variant_tag() {
        let evt = SemanticEvent::ToolCallDone {
            call_id: "call_1".into(),
            name: "lookup".into(),
            args: json!({}),
        };
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value["type"], evt.kind().as_str());
    }

    #[test]
    fn kind_from_str_roundtrip() {
        for kind in SemanticKind::all() {
            let parsed: SemanticKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, *kind);
        }
        assert_matches!("user:unknown".parse::<SemanticKind>(), Err(UnknownKind(_)));
    }
}
