//! Bridge message handlers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use sandbox_bridge_core::error::{BridgeError, Result};
use sandbox_bridge_core::protocol::{Envelope, MessageKind, RESPONSE};
use sandbox_bridge_core::types::{ImageRequest, InteractionEvent, UserProgress};

use crate::state::HostState;

/// Dispatch one inbound envelope and return the reply to post, if any.
///
/// Acks are never answered. Unknown types get an error reply only when they
/// carry a `requestId`; recognised types are rejected unless the channel's
/// interaction is the active one.
pub async fn dispatch_message(
    state: &Arc<HostState>,
    channel_id: &str,
    envelope: Envelope,
) -> Option<Envelope> {
    if envelope.is_ack() {
        debug!(kind = %envelope.kind, "Ignoring ack on host side");
        return None;
    }

    let kind = match envelope.kind.parse::<MessageKind>() {
        Ok(kind) => kind,
        Err(err) => {
            warn!(kind = %envelope.kind, "Unknown message type");
            return envelope
                .request_id
                .as_deref()
                .map(|id| Envelope::error_ack(&envelope.kind, Some(id), &err));
        }
    };
    let request_id = envelope.request_id.clone();

    if !channel_is_live(state, channel_id).await {
        debug!(%kind, channel_id, "Rejecting message for an uninitialised interaction");
        return Some(error_reply(kind, request_id.as_deref(), &BridgeError::NotInitialized));
    }

    debug!(%kind, channel_id, "Dispatching message");
    match dispatch_kind(state, channel_id, kind, &envelope).await {
        Ok(payload) => Some(Envelope::ack(kind.as_str(), request_id.as_deref(), payload)),
        Err(err) => {
            debug!(%kind, code = err.code(), %err, "Handler failed");
            Some(error_reply(kind, request_id.as_deref(), &err))
        }
    }
}

async fn dispatch_kind(
    state: &Arc<HostState>,
    channel_id: &str,
    kind: MessageKind,
    envelope: &Envelope,
) -> Result<Value> {
    let facade = &state.facade;
    match kind {
        MessageKind::EmitEvent => handle_emit_event(state, envelope).await,
        MessageKind::UpdateState => handle_update_state(state, envelope),
        MessageKind::GetState => handle_get_state(state, envelope),
        MessageKind::GetContext => {
            let ids = state.context.ids().ok_or(BridgeError::NotInitialized)?;
            Ok(serde_json::to_value(ids)?)
        }
        MessageKind::Subscribe => handle_subscribe(state, channel_id, envelope).await,
        MessageKind::Unsubscribe => handle_unsubscribe(state, channel_id, envelope),
        MessageKind::RequestAiResponse => {
            let prompt = required_str(envelope, "prompt")?;
            let response = state.context.request_ai_response(prompt).await?;
            Ok(json!({ "response": response }))
        }

        // ============================================================
        // Chat UI
        // ============================================================
        MessageKind::MinimizeChatUi => facade.minimize_chat().map(|_| json!({})),
        MessageKind::ShowChatUi => facade.show_chat().map(|_| json!({})),
        MessageKind::ActivateFullscreen => facade.set_fullscreen(true).map(|_| json!({})),
        MessageKind::DeactivateFullscreen => facade.set_fullscreen(false).map(|_| json!({})),
        MessageKind::PostToChat => {
            let content = required_str(envelope, "content")?;
            facade
                .post_to_chat(content, envelope.str_field("role"), open_chat(envelope))
                .map(|_| json!({}))
        }
        MessageKind::ShowScript => {
            let content = required_str(envelope, "content")?;
            facade
                .show_script(content, open_chat(envelope))
                .map(|_| json!({}))
        }
        MessageKind::ShowSnack => {
            let content = required_str(envelope, "content")?;
            let duration = envelope.get("durationMs").and_then(Value::as_u64);
            let snack_id = facade.show_snack(content, duration)?;
            Ok(json!({ "snackId": snack_id }))
        }
        MessageKind::HideSnack => facade
            .hide_snack(envelope.str_field("snackId"))
            .map(|_| json!({})),
        MessageKind::ShowOverlay => {
            let content = envelope.get("content").cloned().unwrap_or(Value::Null);
            facade.show_overlay(&content).map(|_| json!({}))
        }
        MessageKind::HideOverlay => facade.hide_overlay().map(|_| json!({})),

        // ============================================================
        // Persistence
        // ============================================================
        MessageKind::SaveInstanceData => {
            let data = envelope.get("data").cloned().unwrap_or(Value::Null);
            Ok(serde_json::to_value(facade.save_instance_data(data).await?)?)
        }
        MessageKind::GetInstanceDataHistory => {
            let filters = envelope.get("filters").cloned().unwrap_or(Value::Null);
            Ok(serde_json::to_value(
                facade.get_instance_data_history(filters).await?,
            )?)
        }
        MessageKind::SaveUserProgress => {
            let progress: UserProgress = field(envelope, "progress")?;
            let saved = facade.save_user_progress(&progress).await?;
            Ok(json!({ "progress": saved }))
        }
        MessageKind::GetUserProgress => {
            let progress = facade.get_user_progress().await?;
            Ok(json!({ "progress": progress }))
        }
        MessageKind::MarkCompleted => Ok(serde_json::to_value(facade.mark_completed().await?)?),
        MessageKind::IncrementAttempts => {
            Ok(serde_json::to_value(facade.increment_attempts().await?)?)
        }
        MessageKind::GetUserPublicProfile => Ok(serde_json::to_value(
            facade
                .get_user_public_profile(envelope.str_field("userId"))
                .await?,
        )?),

        // ============================================================
        // Images
        // ============================================================
        MessageKind::GenerateImage => {
            let request: ImageRequest =
                serde_json::from_value(Value::Object(envelope.payload.clone()))
                    .map_err(|e| BridgeError::InvalidParams(e.to_string()))?;
            let lesson_id = active_lesson(state)?;
            Ok(serde_json::to_value(
                facade.generate_image(&lesson_id, &request).await,
            )?)
        }
        MessageKind::GetLessonImages => {
            let lesson_id = active_lesson(state)?;
            Ok(serde_json::to_value(
                facade.get_lesson_images(&lesson_id).await,
            )?)
        }
        MessageKind::GetLessonImageIds => {
            let lesson_id = active_lesson(state)?;
            Ok(serde_json::to_value(
                facade.get_lesson_image_ids(&lesson_id).await,
            )?)
        }
        MessageKind::DeleteImage => {
            let image_id = required_str(envelope, "imageId")?;
            let lesson_id = active_lesson(state)?;
            Ok(serde_json::to_value(
                facade.delete_image(&lesson_id, image_id).await,
            )?)
        }

        // ============================================================
        // Media
        // ============================================================
        MessageKind::MediaPlay => Ok(json!({ "applied": facade.play_media() })),
        MessageKind::MediaPause => Ok(json!({ "applied": facade.pause_media() })),
        MessageKind::MediaSeek => {
            let time = required_f64(envelope, "time")?;
            Ok(json!({ "applied": facade.seek_media(time) }))
        }
        MessageKind::MediaVolume => {
            let volume = required_f64(envelope, "volume")?;
            Ok(json!({ "applied": facade.set_media_volume(volume) }))
        }
        MessageKind::MediaCurrentTime => {
            Ok(json!({ "currentTime": facade.media_current_time()? }))
        }
        MessageKind::MediaDuration => Ok(json!({ "duration": facade.media_duration()? })),
        MessageKind::MediaIsPlaying => Ok(json!({ "isPlaying": facade.media_is_playing()? })),
    }
}

// ============================================================
// Context handlers
// ============================================================

async fn handle_emit_event(state: &Arc<HostState>, envelope: &Envelope) -> Result<Value> {
    let event: InteractionEvent = field(envelope, "event")?;
    let processed_content_id = envelope.str_field("processedContentId").map(String::from);
    let published = state.context.emit_event(event, processed_content_id).await;
    Ok(json!({ "published": published }))
}

fn handle_update_state(state: &Arc<HostState>, envelope: &Envelope) -> Result<Value> {
    if let Some(Value::Object(updates)) = envelope.get("updates") {
        state.context.merge_state(updates.clone())?;
        return Ok(json!({}));
    }
    let key = required_str(envelope, "key")?;
    let value = envelope.get("value").cloned().unwrap_or(Value::Null);
    state.context.update_state(key, value)?;
    Ok(json!({}))
}

fn handle_get_state(state: &Arc<HostState>, envelope: &Envelope) -> Result<Value> {
    match envelope.str_field("key") {
        Some(key) => Ok(json!({ "value": state.context.get_state(key)? })),
        None => Ok(json!({ "state": state.context.state_snapshot()? })),
    }
}

async fn handle_subscribe(
    state: &Arc<HostState>,
    channel_id: &str,
    envelope: &Envelope,
) -> Result<Value> {
    let subscription_id = subscription_id(envelope)?;
    let sender = state
        .channel_sender(channel_id)
        .await
        .ok_or(BridgeError::ChannelClosed)?;
    let interaction_id = state
        .channel_interaction(channel_id)
        .await
        .ok_or(BridgeError::ChannelClosed)?;

    let sub = subscription_id.clone();
    let observer = state.context.on_response(move |response| {
        if response
            .interaction_id
            .as_deref()
            .is_some_and(|id| id != interaction_id)
        {
            return;
        }
        let push = Envelope::new(RESPONSE)
            .with_subscription(&sub)
            .with_field("response", json!(response));
        if sender.post(push).is_err() {
            debug!(subscription_id = %sub, "Subscriber channel closed");
        }
    });

    let context = state.context.clone();
    let inserted = state.subscriptions.insert(
        &subscription_id,
        channel_id,
        Box::new(move || {
            context.remove_observer(observer);
        }),
    );
    if let Err(err) = inserted {
        state.context.remove_observer(observer);
        return Err(err);
    }
    debug!(subscription_id = %subscription_id, channel_id, "Subscribed to AI responses");
    Ok(json!({ "subscriptionId": subscription_id }))
}

fn handle_unsubscribe(
    state: &Arc<HostState>,
    channel_id: &str,
    envelope: &Envelope,
) -> Result<Value> {
    let subscription_id = subscription_id(envelope)?;
    let removed = state.subscriptions.remove(&subscription_id, channel_id);
    Ok(json!({ "removed": removed }))
}

// ============================================================
// Helpers
// ============================================================

/// A channel may only talk to the interaction it was mounted for, and only
/// while that interaction is the active one.
async fn channel_is_live(state: &Arc<HostState>, channel_id: &str) -> bool {
    let Some(active) = state.context.ids() else {
        return false;
    };
    state
        .channel_interaction(channel_id)
        .await
        .is_some_and(|bound| bound == active.interaction_id)
}

fn error_reply(kind: MessageKind, request_id: Option<&str>, err: &BridgeError) -> Envelope {
    Envelope::error_ack(kind.as_str(), request_id, err)
}

fn subscription_id(envelope: &Envelope) -> Result<String> {
    envelope
        .subscription_id
        .clone()
        .or_else(|| envelope.str_field("subscriptionId").map(String::from))
        .ok_or_else(|| BridgeError::InvalidParams("subscriptionId is required".into()))
}

fn required_str<'a>(envelope: &'a Envelope, key: &str) -> Result<&'a str> {
    envelope
        .str_field(key)
        .ok_or_else(|| BridgeError::InvalidParams(format!("{key} is required")))
}

fn required_f64(envelope: &Envelope, key: &str) -> Result<f64> {
    envelope
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| BridgeError::InvalidParams(format!("{key} must be a number")))
}

fn field<T: DeserializeOwned>(envelope: &Envelope, key: &str) -> Result<T> {
    let value = envelope
        .get(key)
        .cloned()
        .ok_or_else(|| BridgeError::InvalidParams(format!("{key} is required")))?;
    serde_json::from_value(value).map_err(|e| BridgeError::InvalidParams(format!("{key}: {e}")))
}

fn open_chat(envelope: &Envelope) -> bool {
    envelope
        .get("openChat")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn active_lesson(state: &Arc<HostState>) -> Result<String> {
    state
        .context
        .ids()
        .map(|ids| ids.lesson_id)
        .ok_or(BridgeError::NotInitialized)
}
