//! Host-side SDK: UI, media, persistence and image operations behind one
//! object, with the persistence scope checked before any network call.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use sandbox_bridge_core::error::{BridgeError, Result};
use sandbox_bridge_core::types::{
    AiResponse, Identity, ImageRequest, Outcome, PersistenceScope, ResponseMetadata, UserProgress,
};

use crate::capabilities::{ChatUi, MediaPlayer, PersistenceApi};

const DEFAULT_ROLE: &str = "assistant";

/// Which surfaces an AI response goes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayPlan {
    pub snack: bool,
    pub chat: bool,
    pub script: bool,
}

/// Resolve display hints. A response is posted to chat unless it asks for a
/// snack and says nothing about chat.
pub fn display_plan(metadata: Option<&ResponseMetadata>) -> DisplayPlan {
    let Some(meta) = metadata else {
        return DisplayPlan {
            chat: true,
            ..Default::default()
        };
    };
    let snack = meta.show_in_snack == Some(true);
    let snack_only = snack && meta.post_to_chat.is_none();
    DisplayPlan {
        snack,
        chat: !snack_only,
        script: meta.show_as_script == Some(true),
    }
}

pub struct SdkFacade {
    scope: RwLock<Option<PersistenceScope>>,
    chat: RwLock<Option<Arc<dyn ChatUi>>>,
    media: RwLock<Option<Arc<dyn MediaPlayer>>>,
    api: Arc<dyn PersistenceApi>,
    identity: Identity,
}

impl SdkFacade {
    pub fn new(api: Arc<dyn PersistenceApi>, identity: Identity) -> Self {
        Self {
            scope: RwLock::new(None),
            chat: RwLock::new(None),
            media: RwLock::new(None),
            api,
            identity,
        }
    }

    pub fn set_context(&self, scope: PersistenceScope) {
        debug!(
            lesson_id = %scope.lesson_id,
            interaction_type_id = %scope.interaction_type_id,
            "Persistence scope set"
        );
        *self.scope.write().unwrap_or_else(|e| e.into_inner()) = Some(scope);
    }

    pub fn clear_context(&self) {
        *self.scope.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn context(&self) -> Option<PersistenceScope> {
        self.scope.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_chat_ui(&self, chat: Option<Arc<dyn ChatUi>>) {
        *self.chat.write().unwrap_or_else(|e| e.into_inner()) = chat;
    }

    pub fn set_media_player(&self, media: Option<Arc<dyn MediaPlayer>>) {
        *self.media.write().unwrap_or_else(|e| e.into_inner()) = media;
    }

    fn chat_ui(&self) -> Result<Arc<dyn ChatUi>> {
        let chat = self.chat.read().unwrap_or_else(|e| e.into_inner()).clone();
        chat.ok_or_else(|| {
            warn!("No chat UI attached");
            BridgeError::CapabilityUnavailable("chat UI".into())
        })
    }

    fn media_player(&self) -> Option<Arc<dyn MediaPlayer>> {
        self.media.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn require_scope(&self) -> Result<PersistenceScope> {
        let scope = self
            .context()
            .ok_or_else(|| BridgeError::MissingContext("set_context has not been called".into()))?;
        scope.validate()?;
        Ok(scope)
    }

    // ============================================================
    // AI response display
    // ============================================================

    pub fn display_response(&self, response: &AiResponse) -> Result<DisplayPlan> {
        let chat = self.chat_ui()?;
        let plan = display_plan(response.metadata.as_ref());
        let meta = response.metadata.clone().unwrap_or_default();

        if plan.snack {
            chat.show_snack(&response.content, meta.snack_duration_ms);
        }
        if plan.chat {
            let role = meta.role.as_deref().unwrap_or(DEFAULT_ROLE);
            chat.add_chat_message(&response.content, role);
        }
        if plan.script {
            chat.show_script(&response.content);
        }
        debug!(?plan, "AI response displayed");
        Ok(plan)
    }

    // ============================================================
    // Chat UI
    // ============================================================

    pub fn show_chat(&self) -> Result<()> {
        self.chat_ui()?.open_widget();
        Ok(())
    }

    pub fn minimize_chat(&self) -> Result<()> {
        self.chat_ui()?.minimize();
        Ok(())
    }

    pub fn set_fullscreen(&self, active: bool) -> Result<()> {
        self.chat_ui()?.set_fullscreen(active);
        Ok(())
    }

    pub fn post_to_chat(&self, content: &str, role: Option<&str>, open_chat: bool) -> Result<()> {
        let chat = self.chat_ui()?;
        if open_chat {
            chat.open_widget();
        }
        chat.add_chat_message(content, role.unwrap_or(DEFAULT_ROLE));
        Ok(())
    }

    pub fn show_script(&self, content: &str, open_chat: bool) -> Result<()> {
        let chat = self.chat_ui()?;
        if open_chat {
            chat.open_widget();
        }
        chat.show_script(content);
        Ok(())
    }

    pub fn show_snack(&self, content: &str, duration_ms: Option<u64>) -> Result<String> {
        Ok(self.chat_ui()?.show_snack(content, duration_ms))
    }

    pub fn hide_snack(&self, snack_id: Option<&str>) -> Result<()> {
        self.chat_ui()?.hide_snack(snack_id);
        Ok(())
    }

    pub fn show_overlay(&self, content: &Value) -> Result<()> {
        self.chat_ui()?.show_overlay(content);
        Ok(())
    }

    pub fn hide_overlay(&self) -> Result<()> {
        self.chat_ui()?.hide_overlay();
        Ok(())
    }

    // ============================================================
    // Persistence
    // ============================================================

    pub async fn save_instance_data(&self, data: Value) -> Result<Outcome> {
        let scope = self.require_scope()?;
        Ok(caught(
            "save_instance_data",
            self.api.save_instance_data(&scope, data).await,
        ))
    }

    pub async fn get_instance_data_history(&self, filters: Value) -> Result<Outcome> {
        let scope = self.require_scope()?;
        Ok(caught(
            "get_instance_data_history",
            self.api.instance_data_history(&scope, filters).await,
        ))
    }

    /// Unlike the other persistence calls, progress failures propagate.
    pub async fn save_user_progress(&self, progress: &UserProgress) -> Result<Value> {
        let scope = self.require_scope()?;
        self.api
            .save_user_progress(&scope, progress)
            .await
            .map_err(|e| BridgeError::RemoteFailure(format!("{e:#}")))
    }

    pub async fn get_user_progress(&self) -> Result<Value> {
        let scope = self.require_scope()?;
        self.api
            .user_progress(&scope)
            .await
            .map_err(|e| BridgeError::RemoteFailure(format!("{e:#}")))
    }

    pub async fn mark_completed(&self) -> Result<Outcome> {
        let scope = self.require_scope()?;
        Ok(caught("mark_completed", self.api.mark_completed(&scope).await))
    }

    pub async fn increment_attempts(&self) -> Result<Outcome> {
        let scope = self.require_scope()?;
        Ok(caught(
            "increment_attempts",
            self.api.increment_attempts(&scope).await,
        ))
    }

    /// Falls back to the configured identity when no user id is given.
    pub async fn get_user_public_profile(&self, user_id: Option<&str>) -> Result<Outcome> {
        let user_id = user_id
            .or(self.identity.user_id.as_deref())
            .ok_or_else(|| BridgeError::InvalidParams("userId is required".into()))?;
        Ok(caught(
            "get_user_public_profile",
            self.api.user_public_profile(user_id).await,
        ))
    }

    // ============================================================
    // Images
    // ============================================================

    pub async fn generate_image(&self, lesson_id: &str, request: &ImageRequest) -> Outcome {
        caught(
            "generate_image",
            self.api.generate_image(lesson_id, request).await,
        )
    }

    pub async fn get_lesson_images(&self, lesson_id: &str) -> Outcome {
        caught("get_lesson_images", self.api.lesson_images(lesson_id).await)
    }

    pub async fn get_lesson_image_ids(&self, lesson_id: &str) -> Outcome {
        caught(
            "get_lesson_image_ids",
            self.api.lesson_image_ids(lesson_id).await,
        )
    }

    pub async fn delete_image(&self, lesson_id: &str, image_id: &str) -> Outcome {
        caught(
            "delete_image",
            self.api.delete_image(lesson_id, image_id).await,
        )
    }

    // ============================================================
    // Media
    // ============================================================

    /// Commands are no-ops without a player; they report whether they applied.
    pub fn play_media(&self) -> bool {
        self.with_player("play", |p| p.play())
    }

    pub fn pause_media(&self) -> bool {
        self.with_player("pause", |p| p.pause())
    }

    pub fn seek_media(&self, seconds: f64) -> bool {
        self.with_player("seek", |p| p.seek(seconds.max(0.0)))
    }

    pub fn set_media_volume(&self, volume: f64) -> bool {
        self.with_player("volume", |p| p.set_volume(volume.clamp(0.0, 1.0)))
    }

    pub fn media_current_time(&self) -> Result<f64> {
        self.query_player(|p| p.current_time())
    }

    pub fn media_duration(&self) -> Result<f64> {
        self.query_player(|p| p.duration())
    }

    pub fn media_is_playing(&self) -> Result<bool> {
        self.query_player(|p| p.is_playing())
    }

    fn with_player(&self, command: &str, f: impl FnOnce(&dyn MediaPlayer)) -> bool {
        match self.media_player() {
            Some(player) => {
                f(player.as_ref());
                true
            }
            None => {
                warn!(command, "No media player attached, ignoring command");
                false
            }
        }
    }

    fn query_player<T>(&self, f: impl FnOnce(&dyn MediaPlayer) -> T) -> Result<T> {
        self.media_player()
            .map(|p| f(p.as_ref()))
            .ok_or_else(|| BridgeError::CapabilityUnavailable("media player".into()))
    }
}

fn caught(operation: &str, result: anyhow::Result<Value>) -> Outcome {
    match result {
        Ok(data) => Outcome::ok(data),
        Err(e) => {
            warn!(operation, error = %e, "Persistence call failed");
            Outcome::failed(format!("{e:#}"))
        }
    }
}
