use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Identifiers of one mounted interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionIds {
    pub lesson_id: String,
    pub substage_id: String,
    pub interaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_content_id: Option<String>,
}

impl InteractionIds {
    pub fn new(lesson_id: &str, substage_id: &str, interaction_id: &str) -> Self {
        Self {
            lesson_id: lesson_id.to_string(),
            substage_id: substage_id.to_string(),
            interaction_id: interaction_id.to_string(),
            processed_content_id: None,
        }
    }

    pub fn with_processed_content(mut self, id: Option<String>) -> Self {
        self.processed_content_id = id;
        self
    }
}

/// The single active interaction context: identifiers plus an in-memory state bag.
#[derive(Debug, Clone)]
pub struct InteractionContext {
    pub ids: InteractionIds,
    pub state: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl InteractionContext {
    pub fn new(ids: InteractionIds) -> Self {
        Self {
            ids,
            state: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn state_snapshot(&self) -> serde_json::Map<String, Value> {
        self.state
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Identifiers every persistence call is keyed by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceScope {
    #[serde(default)]
    pub lesson_id: String,
    #[serde(default)]
    pub stage_id: String,
    #[serde(default)]
    pub substage_id: String,
    #[serde(default)]
    pub interaction_type_id: String,
}

impl PersistenceScope {
    /// Fails with the names of any empty identifiers.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("lessonId", &self.lesson_id),
            ("stageId", &self.stage_id),
            ("substageId", &self.substage_id),
            ("interactionTypeId", &self.interaction_type_id),
        ]
        .iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::MissingContext(missing.join(", ")))
        }
    }
}

/// User and tenant identity forwarded with events and HTTP calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Display hints attached to an AI response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_in_snack: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_to_chat: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_as_script: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snack_duration_ms: Option<u64>,
}

/// An AI tutor response pushed from the real-time channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_content_id: Option<String>,
}

/// A host-side action pushed from the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionAction {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// Inbound push events from the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushEvent {
    Response(AiResponse),
    Action(InteractionAction),
}

/// A telemetry event emitted by interaction code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Outbound messages published on the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RealtimeMessage {
    InteractionEvent {
        context: InteractionIds,
        event: InteractionEvent,
        state: serde_json::Map<String, Value>,
        identity: Identity,
    },
    AiRequest {
        context: InteractionIds,
        prompt: String,
        identity: Identity,
    },
}

/// Learner progress for one interaction. A score of `0` is a real score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Image generation request forwarded to the HTTP API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

/// Result shape for calls that catch remote failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}
