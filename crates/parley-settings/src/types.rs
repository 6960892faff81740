//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial override only needs to
//! name the fields it changes. Field names are `camelCase` on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tracing::warn;

use crate::errors::{Result, SettingsError};
use crate::loader::deep_merge;

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Instruction used when a greeting is enabled without explicit text.
pub const DEFAULT_GREETING_INSTRUCTIONS: &str =
    "Greet the user briefly and ask how you can help today.";

/// Label of the control channel expected by the realtime backend.
pub const DEFAULT_CHANNEL_LABEL: &str = "oai-events";

/// Default description-exchange endpoint.
pub const DEFAULT_EXCHANGE_URL: &str = "https://api.openai.com/v1/realtime";

pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Complete configuration for one realtime session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    pub transport: TransportSettings,
    pub media: MediaConstraints,
    pub exchange: ExchangeSettings,
    /// Patch sent as `session.update` once the control channel opens.
    pub session: Value,
    /// Send `session` automatically when the control channel opens.
    pub auto_configure: bool,
    pub greeting: GreetingPolicy,
    pub chat: ChatPolicy,
    pub logging: LoggingPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            media: MediaConstraints::default(),
            exchange: ExchangeSettings::default(),
            session: json!({
                "modalities": ["audio", "text"],
                "input_audio_transcription": { "model": "whisper-1" },
                "turn_detection": { "type": "server_vad" }
            }),
            auto_configure: true,
            greeting: GreetingPolicy::default(),
            chat: ChatPolicy::default(),
            logging: LoggingPolicy::default(),
        }
    }
}

impl SessionSettings {
    /// Deep-merge `overrides` over the compiled defaults and apply derived rules.
    ///
    /// `null` means no overrides. Any other non-object value is ignored with a
    /// warning.
    pub fn with_overrides(overrides: Value) -> Result<Self> {
        let defaults = serde_json::to_value(Self::default())?;
        let overrides = match overrides {
            Value::Object(_) | Value::Null => overrides,
            other => {
                warn!(kind = json_kind(&other), "ignoring non-object settings overrides");
                Value::Null
            }
        };
        let merged = deep_merge(defaults, overrides);
        let settings: Self = serde_json::from_value(merged)?;
        settings.finalize()
    }

    /// Apply derived rules and validate.
    ///
    /// A greeting that is enabled without instructions gets
    /// [`DEFAULT_GREETING_INSTRUCTIONS`].
    pub fn finalize(mut self) -> Result<Self> {
        if self.greeting.enabled
            && self
                .greeting
                .instructions
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            self.greeting.instructions = Some(DEFAULT_GREETING_INSTRUCTIONS.to_string());
        }
        if self.transport.channel_label.trim().is_empty() {
            return Err(SettingsError::InvalidValue("channel label is empty".into()));
        }
        if !self.session.is_object() {
            return Err(SettingsError::InvalidValue(
                "session parameters must be a JSON object".into(),
            ));
        }
        Ok(self)
    }
}

/// Transport and control-channel configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportSettings {
    /// STUN/TURN relays handed to the transport engine.
    pub ice_servers: Vec<IceServer>,
    pub channel_label: String,
    /// Request in-order delivery on the control channel.
    pub ordered: bool,
    pub offer: OfferOptions,
    /// `balanced`, `max-compat`, or `max-bundle`.
    pub bundle_policy: String,
    /// Upper bound on waiting for ICE gathering before sending the offer.
    pub ice_gathering_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: None,
                credential: None,
            }],
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            ordered: true,
            offer: OfferOptions::default(),
            bundle_policy: "max-bundle".into(),
            ice_gathering_timeout_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Offer shaping passed to the transport engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: false,
            ice_restart: false,
        }
    }
}

/// Local capture constraints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConstraints {
    /// Capture a microphone track.
    pub audio: bool,
    /// Fail `connect()` when the microphone cannot be acquired. When false the
    /// session falls back to receive-only audio.
    pub required: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            required: true,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Where the local description is exchanged for the remote one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeSettings {
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EXCHANGE_URL.into(),
            model: DEFAULT_MODEL.into(),
            timeout_ms: 15_000,
        }
    }
}

/// Whether the assistant speaks first once the channel opens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GreetingPolicy {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatPolicy {
    /// Maintain the reconciled chat list.
    pub enabled: bool,
}

impl Default for ChatPolicy {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingPolicy {
    /// Log connection milestones at `info` (otherwise `debug`).
    pub milestones: bool,
}

impl Default for LoggingPolicy {
    fn default() -> Self {
        Self { milestones: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let s = SessionSettings::default();
        assert_eq!(s.transport.channel_label, "oai-events");
        assert!(s.transport.ordered);
        assert_eq!(s.transport.ice_gathering_timeout_ms, 2_000);
        assert!(s.media.audio);
        assert!(s.auto_configure);
        assert!(!s.greeting.enabled);
        assert!(s.chat.enabled);
        assert_eq!(s.exchange.model, DEFAULT_MODEL);
    }

    #[test]
    fn null_overrides_yield_defaults() {
        let s = SessionSettings::with_overrides(Value::Null).unwrap();
        assert_eq!(s, SessionSettings::default());
    }

    #[test]
    fn non_object_overrides_are_ignored() {
        let s = SessionSettings::with_overrides(json!(["not", "settings"])).unwrap();
        assert_eq!(s, SessionSettings::default());
    }

    #[test]
    fn overrides_merge_nested_fields() {
        let s = SessionSettings::with_overrides(json!({
            "transport": { "channelLabel": "events" },
            "session": { "voice": "verse" }
        }))
        .unwrap();
        assert_eq!(s.transport.channel_label, "events");
        // sibling fields survive
        assert!(s.transport.ordered);
        assert_eq!(s.session["voice"], "verse");
        assert_eq!(s.session["input_audio_transcription"]["model"], "whisper-1");
    }

    #[test]
    fn arrays_replace_wholesale() {
        let s = SessionSettings::with_overrides(json!({
            "transport": { "iceServers": [{ "urls": ["turn:relay.example.com"] }] },
            "session": { "modalities": ["text"] }
        }))
        .unwrap();
        assert_eq!(s.transport.ice_servers.len(), 1);
        assert_eq!(s.transport.ice_servers[0].urls, vec!["turn:relay.example.com"]);
        assert_eq!(s.session["modalities"], json!(["text"]));
    }

    #[test]
    fn greeting_without_text_gets_default_instructions() {
        let s = SessionSettings::with_overrides(json!({ "greeting": { "enabled": true } })).unwrap();
        assert_eq!(
            s.greeting.instructions.as_deref(),
            Some(DEFAULT_GREETING_INSTRUCTIONS)
        );
    }

    #[test]
    fn greeting_with_blank_text_gets_default_instructions() {
        let s = SessionSettings::with_overrides(json!({
            "greeting": { "enabled": true, "instructions": "   " }
        }))
        .unwrap();
        assert_eq!(
            s.greeting.instructions.as_deref(),
            Some(DEFAULT_GREETING_INSTRUCTIONS)
        );
    }

    #[test]
    fn greeting_keeps_caller_text() {
        let s = SessionSettings::with_overrides(json!({
            "greeting": { "enabled": true, "instructions": "Say hi in French." }
        }))
        .unwrap();
        assert_eq!(s.greeting.instructions.as_deref(), Some("Say hi in French."));
    }

    #[test]
    fn disabled_greeting_is_left_alone() {
        let s = SessionSettings::default().finalize().unwrap();
        assert!(s.greeting.instructions.is_none());
    }

    #[test]
    fn empty_channel_label_rejected() {
        let err = SessionSettings::with_overrides(json!({ "transport": { "channelLabel": "" } }))
            .unwrap_err();
        assert_matches!(err, SettingsError::InvalidValue(_));
    }

    #[test]
    fn non_object_session_rejected() {
        let err = SessionSettings::with_overrides(json!({ "session": [1, 2] })).unwrap_err();
        assert_matches!(err, SettingsError::InvalidValue(_));
    }

    #[test]
    fn wrong_type_is_json_error() {
        let err = SessionSettings::with_overrides(json!({ "autoConfigure": "yes" })).unwrap_err();
        assert_matches!(err, SettingsError::Json(_));
    }
}
