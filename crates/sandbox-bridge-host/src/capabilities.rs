//! Narrow interfaces onto the host components the bridge drives.
//!
//! UI and media components are host-injected references and are called
//! synchronously; persistence and the real-time channel are remote.

use async_trait::async_trait;
use serde_json::Value;

use sandbox_bridge_core::types::{ImageRequest, PersistenceScope, RealtimeMessage, UserProgress};

/// The host chat widget and its surrounding chrome.
pub trait ChatUi: Send + Sync {
    fn open_widget(&self);
    fn minimize(&self);
    fn add_chat_message(&self, content: &str, role: &str);
    fn show_script(&self, content: &str);
    /// Returns the id of the snack shown.
    fn show_snack(&self, content: &str, duration_ms: Option<u64>) -> String;
    fn hide_snack(&self, snack_id: Option<&str>);
    fn set_fullscreen(&self, active: bool);
    fn show_overlay(&self, content: &Value);
    fn hide_overlay(&self);
}

/// The lesson media player.
pub trait MediaPlayer: Send + Sync {
    fn play(&self);
    fn pause(&self);
    fn seek(&self, seconds: f64);
    fn set_volume(&self, volume: f64);
    fn current_time(&self) -> f64;
    fn duration(&self) -> f64;
    fn is_playing(&self) -> bool;
}

/// HTTP persistence and image API.
#[async_trait]
pub trait PersistenceApi: Send + Sync {
    async fn save_instance_data(&self, scope: &PersistenceScope, data: Value) -> anyhow::Result<Value>;

    async fn instance_data_history(
        &self,
        scope: &PersistenceScope,
        filters: Value,
    ) -> anyhow::Result<Value>;

    async fn save_user_progress(
        &self,
        scope: &PersistenceScope,
        progress: &UserProgress,
    ) -> anyhow::Result<Value>;

    async fn user_progress(&self, scope: &PersistenceScope) -> anyhow::Result<Value>;

    async fn mark_completed(&self, scope: &PersistenceScope) -> anyhow::Result<Value>;

    async fn increment_attempts(&self, scope: &PersistenceScope) -> anyhow::Result<Value>;

    async fn user_public_profile(&self, user_id: &str) -> anyhow::Result<Value>;

    async fn generate_image(&self, lesson_id: &str, request: &ImageRequest) -> anyhow::Result<Value>;

    async fn lesson_images(&self, lesson_id: &str) -> anyhow::Result<Value>;

    async fn lesson_image_ids(&self, lesson_id: &str) -> anyhow::Result<Value>;

    async fn delete_image(&self, lesson_id: &str, image_id: &str) -> anyhow::Result<Value>;
}

/// Outbound side of the real-time pub/sub channel.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn publish(&self, message: RealtimeMessage) -> anyhow::Result<()>;
}
