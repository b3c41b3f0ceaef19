//! Sandbox bridge wire protocol.
//!
//! Every message is a flat JSON object with a `type` discriminator, an optional
//! `requestId` correlating a request with its single reply, an optional
//! `subscriptionId` for durable push delivery, and free-form payload fields
//! flattened alongside them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BridgeError;
use crate::types::InteractionIds;

/// Reserved namespace prefix for every bridge message type.
pub const NAMESPACE_PREFIX: &str = "ai-sdk-";

/// Suffix appended to a request type to form its reply type.
pub const ACK_SUFFIX: &str = "-ack";

/// Lifecycle event sent when a context becomes active for a channel.
pub const READY: &str = "ai-sdk-ready";

/// Lifecycle event sent when the active context is torn down.
pub const DESTROYED: &str = "ai-sdk-destroyed";

/// Push event delivered to a durable subscription.
pub const RESPONSE: &str = "ai-sdk-response";

/// A bridge message envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(rename = "subscriptionId", default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Build a request envelope, flattening `data` into the payload. A
    /// `subscriptionId` key in `data` is lifted into its envelope field so the
    /// in-process and serialized forms agree.
    pub fn request(kind: MessageKind, request_id: &str, data: Value) -> Self {
        let mut payload = into_object(data);
        let subscription_id = match payload.remove("subscriptionId") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        Self {
            kind: kind.as_str().to_string(),
            request_id: Some(request_id.to_string()),
            subscription_id,
            payload,
        }
    }

    /// Build a success reply for `kind`, echoing the request id.
    pub fn ack(kind: &str, request_id: Option<&str>, payload: Value) -> Self {
        Self {
            kind: ack_type(kind),
            request_id: request_id.map(String::from),
            subscription_id: None,
            payload: into_object(payload),
        }
    }

    /// Build an error reply for `kind` carrying `{error, code}`.
    pub fn error_ack(kind: &str, request_id: Option<&str>, err: &BridgeError) -> Self {
        let mut payload = Map::new();
        payload.insert("error".into(), Value::String(err.to_string()));
        payload.insert("code".into(), Value::String(err.code().to_string()));
        Self {
            kind: ack_type(kind),
            request_id: request_id.map(String::from),
            subscription_id: None,
            payload,
        }
    }

    pub fn with_subscription(mut self, subscription_id: &str) -> Self {
        self.subscription_id = Some(subscription_id.to_string());
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Whether the type carries the reserved namespace prefix.
    pub fn is_namespaced(&self) -> bool {
        self.kind.starts_with(NAMESPACE_PREFIX)
    }

    pub fn is_ack(&self) -> bool {
        self.kind.ends_with(ACK_SUFFIX)
    }

    /// Decode an `{error, code}` reply into a [`BridgeError::Remote`].
    ///
    /// Replies carrying `success` are outcomes, not errors, even when they
    /// include an `error` string.
    pub fn error(&self) -> Option<BridgeError> {
        if self.payload.contains_key("success") {
            return None;
        }
        let message = match self.payload.get("error")? {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let code = self
            .str_field("code")
            .unwrap_or("remote_failure")
            .to_string();
        Some(BridgeError::Remote { code, message })
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.payload)
    }
}

/// Reply type for a request type.
pub fn ack_type(kind: &str) -> String {
    format!("{kind}{ACK_SUFFIX}")
}

/// Treat an object as a payload map; wrap anything else under `value`.
pub fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

/// Every request type the host dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    EmitEvent,
    UpdateState,
    GetState,
    GetContext,
    Subscribe,
    Unsubscribe,
    RequestAiResponse,
    MinimizeChatUi,
    ShowChatUi,
    ActivateFullscreen,
    DeactivateFullscreen,
    PostToChat,
    ShowScript,
    ShowSnack,
    HideSnack,
    ShowOverlay,
    HideOverlay,
    SaveInstanceData,
    GetInstanceDataHistory,
    SaveUserProgress,
    GetUserProgress,
    MarkCompleted,
    IncrementAttempts,
    GetUserPublicProfile,
    GenerateImage,
    GetLessonImages,
    GetLessonImageIds,
    DeleteImage,
    MediaPlay,
    MediaPause,
    MediaSeek,
    MediaVolume,
    MediaCurrentTime,
    MediaDuration,
    MediaIsPlaying,
}

impl MessageKind {
    pub const ALL: [MessageKind; 35] = [
        Self::EmitEvent,
        Self::UpdateState,
        Self::GetState,
        Self::GetContext,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::RequestAiResponse,
        Self::MinimizeChatUi,
        Self::ShowChatUi,
        Self::ActivateFullscreen,
        Self::DeactivateFullscreen,
        Self::PostToChat,
        Self::ShowScript,
        Self::ShowSnack,
        Self::HideSnack,
        Self::ShowOverlay,
        Self::HideOverlay,
        Self::SaveInstanceData,
        Self::GetInstanceDataHistory,
        Self::SaveUserProgress,
        Self::GetUserProgress,
        Self::MarkCompleted,
        Self::IncrementAttempts,
        Self::GetUserPublicProfile,
        Self::GenerateImage,
        Self::GetLessonImages,
        Self::GetLessonImageIds,
        Self::DeleteImage,
        Self::MediaPlay,
        Self::MediaPause,
        Self::MediaSeek,
        Self::MediaVolume,
        Self::MediaCurrentTime,
        Self::MediaDuration,
        Self::MediaIsPlaying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmitEvent => "ai-sdk-emit-event",
            Self::UpdateState => "ai-sdk-update-state",
            Self::GetState => "ai-sdk-get-state",
            Self::GetContext => "ai-sdk-get-context",
            Self::Subscribe => "ai-sdk-subscribe",
            Self::Unsubscribe => "ai-sdk-unsubscribe",
            Self::RequestAiResponse => "ai-sdk-request-ai-response",
            Self::MinimizeChatUi => "ai-sdk-minimize-chat-ui",
            Self::ShowChatUi => "ai-sdk-show-chat-ui",
            Self::ActivateFullscreen => "ai-sdk-activate-fullscreen",
            Self::DeactivateFullscreen => "ai-sdk-deactivate-fullscreen",
            Self::PostToChat => "ai-sdk-post-to-chat",
            Self::ShowScript => "ai-sdk-show-script",
            Self::ShowSnack => "ai-sdk-show-snack",
            Self::HideSnack => "ai-sdk-hide-snack",
            Self::ShowOverlay => "ai-sdk-show-overlay",
            Self::HideOverlay => "ai-sdk-hide-overlay",
            Self::SaveInstanceData => "ai-sdk-save-instance-data",
            Self::GetInstanceDataHistory => "ai-sdk-get-instance-data-history",
            Self::SaveUserProgress => "ai-sdk-save-user-progress",
            Self::GetUserProgress => "ai-sdk-get-user-progress",
            Self::MarkCompleted => "ai-sdk-mark-completed",
            Self::IncrementAttempts => "ai-sdk-increment-attempts",
            Self::GetUserPublicProfile => "ai-sdk-get-user-public-profile",
            Self::GenerateImage => "ai-sdk-generate-image",
            Self::GetLessonImages => "ai-sdk-get-lesson-images",
            Self::GetLessonImageIds => "ai-sdk-get-lesson-images-ids",
            Self::DeleteImage => "ai-sdk-delete-image",
            Self::MediaPlay => "ai-sdk-media-play",
            Self::MediaPause => "ai-sdk-media-pause",
            Self::MediaSeek => "ai-sdk-media-seek",
            Self::MediaVolume => "ai-sdk-media-volume",
            Self::MediaCurrentTime => "ai-sdk-media-current-time",
            Self::MediaDuration => "ai-sdk-media-duration",
            Self::MediaIsPlaying => "ai-sdk-media-is-playing",
        }
    }

    /// Capabilities that may take seconds to settle.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Self::RequestAiResponse | Self::GenerateImage)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| BridgeError::UnknownMessageType(s.to_string()))
    }
}

/// Lifecycle events sent from host to mounted channels.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Ready(InteractionIds),
    Destroyed(Option<InteractionIds>),
}

impl LifecycleEvent {
    pub fn to_envelope(&self) -> Envelope {
        let (kind, ids) = match self {
            Self::Ready(ids) => (READY, Some(ids)),
            Self::Destroyed(ids) => (DESTROYED, ids.as_ref()),
        };
        let mut envelope = Envelope::new(kind);
        if let Some(ids) = ids {
            envelope.payload.insert("lessonId".into(), Value::String(ids.lesson_id.clone()));
            envelope
                .payload
                .insert("substageId".into(), Value::String(ids.substage_id.clone()));
            envelope.payload.insert(
                "interactionId".into(),
                Value::String(ids.interaction_id.clone()),
            );
        }
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_flattens_payload() {
        let env = Envelope::request(MessageKind::UpdateState, "req-1", json!({"key": "foo", "value": 1}));
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(
            wire,
            json!({"type": "ai-sdk-update-state", "requestId": "req-1", "key": "foo", "value": 1})
        );

        let back: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(back.request_id.as_deref(), Some("req-1"));
        assert_eq!(back.get("value"), Some(&json!(1)));
        assert!(back.payload.get("type").is_none());
    }

    #[test]
    fn test_envelope_without_optional_fields() {
        let env: Envelope = serde_json::from_str(r#"{"type":"ai-sdk-ready"}"#).unwrap();
        assert_eq!(env.kind, READY);
        assert!(env.request_id.is_none());
        assert!(env.subscription_id.is_none());
        assert!(env.payload.is_empty());
    }

    #[test]
    fn test_error_ack_decodes() {
        let ack = Envelope::error_ack(
            MessageKind::GetState.as_str(),
            Some("req-9"),
            &BridgeError::NotInitialized,
        );
        assert_eq!(ack.kind, "ai-sdk-get-state-ack");
        assert!(ack.is_ack());
        match ack.error() {
            Some(BridgeError::Remote { code, .. }) => assert_eq!(code, "not_initialized"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_null_error_is_success() {
        let ack = Envelope::ack("ai-sdk-get-state", Some("r"), json!({"error": null, "state": {}}));
        assert!(ack.error().is_none());

        let outcome = Envelope::ack(
            "ai-sdk-save-instance-data",
            Some("r"),
            json!({"success": false, "error": "HTTP 500"}),
        );
        assert!(outcome.error().is_none());
    }

    #[test]
    fn test_message_kind_parse() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
            assert!(kind.as_str().starts_with(NAMESPACE_PREFIX));
        }
        assert!("ai-sdk-self-destruct".parse::<MessageKind>().is_err());
        assert!("ai-sdk-get-state-ack".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_scalar_payload_is_wrapped() {
        let ack = Envelope::ack("ai-sdk-media-duration", Some("r"), json!(12.5));
        assert_eq!(ack.get("value"), Some(&json!(12.5)));
    }

    #[test]
    fn test_lifecycle_envelopes() {
        let ids = InteractionIds::new("lesson-1", "sub-1", "int-1");
        let ready = LifecycleEvent::Ready(ids).to_envelope();
        assert_eq!(ready.kind, READY);
        assert_eq!(ready.str_field("interactionId"), Some("int-1"));

        let destroyed = LifecycleEvent::Destroyed(None).to_envelope();
        assert_eq!(destroyed.kind, DESTROYED);
        assert!(destroyed.payload.is_empty());
    }
}
