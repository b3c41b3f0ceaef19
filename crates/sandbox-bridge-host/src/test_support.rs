//! Recording doubles for the capability traits.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use sandbox_bridge_core::types::{ImageRequest, PersistenceScope, RealtimeMessage, UserProgress};

use crate::capabilities::{ChatUi, MediaPlayer, PersistenceApi, RealtimeChannel};

#[derive(Default)]
pub struct RecordingRealtime {
    published: Mutex<Vec<RealtimeMessage>>,
    fail: bool,
}

impl RecordingRealtime {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<RealtimeMessage> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeChannel for RecordingRealtime {
    async fn publish(&self, message: RealtimeMessage) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("realtime channel offline");
        }
        self.published.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingChatUi {
    calls: Mutex<Vec<String>>,
}

impl RecordingChatUi {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ChatUi for RecordingChatUi {
    fn open_widget(&self) {
        self.record("open".into());
    }
    fn minimize(&self) {
        self.record("minimize".into());
    }
    fn add_chat_message(&self, content: &str, role: &str) {
        self.record(format!("chat:{role}:{content}"));
    }
    fn show_script(&self, content: &str) {
        self.record(format!("script:{content}"));
    }
    fn show_snack(&self, content: &str, _duration_ms: Option<u64>) -> String {
        self.record(format!("snack:{content}"));
        "snack-1".into()
    }
    fn hide_snack(&self, snack_id: Option<&str>) {
        self.record(format!("hide-snack:{}", snack_id.unwrap_or("*")));
    }
    fn set_fullscreen(&self, active: bool) {
        self.record(format!("fullscreen:{active}"));
    }
    fn show_overlay(&self, content: &Value) {
        self.record(format!("overlay:{content}"));
    }
    fn hide_overlay(&self) {
        self.record("hide-overlay".into());
    }
}

pub struct FakeMedia {
    pub playing: Mutex<bool>,
    pub position: Mutex<f64>,
    pub volume: Mutex<f64>,
}

impl Default for FakeMedia {
    fn default() -> Self {
        Self {
            playing: Mutex::new(false),
            position: Mutex::new(0.0),
            volume: Mutex::new(1.0),
        }
    }
}

impl MediaPlayer for FakeMedia {
    fn play(&self) {
        *self.playing.lock().unwrap() = true;
    }
    fn pause(&self) {
        *self.playing.lock().unwrap() = false;
    }
    fn seek(&self, seconds: f64) {
        *self.position.lock().unwrap() = seconds;
    }
    fn set_volume(&self, volume: f64) {
        *self.volume.lock().unwrap() = volume;
    }
    fn current_time(&self) -> f64 {
        *self.position.lock().unwrap()
    }
    fn duration(&self) -> f64 {
        120.0
    }
    fn is_playing(&self) -> bool {
        *self.playing.lock().unwrap()
    }
}

/// Persistence double that records every call it receives.
#[derive(Default)]
pub struct MockPersistence {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl MockPersistence {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str, body: Value) -> anyhow::Result<Value> {
        self.calls.lock().unwrap().push(call.to_string());
        if self.fail {
            anyhow::bail!("HTTP 503 Service Unavailable");
        }
        Ok(body)
    }
}

#[async_trait]
impl PersistenceApi for MockPersistence {
    async fn save_instance_data(&self, _scope: &PersistenceScope, data: Value) -> anyhow::Result<Value> {
        self.record("save_instance_data", json!({"id": "inst-1", "data": data}))
    }

    async fn instance_data_history(
        &self,
        _scope: &PersistenceScope,
        _filters: Value,
    ) -> anyhow::Result<Value> {
        self.record("instance_data_history", json!([]))
    }

    async fn save_user_progress(
        &self,
        _scope: &PersistenceScope,
        progress: &UserProgress,
    ) -> anyhow::Result<Value> {
        self.record("save_user_progress", serde_json::to_value(progress)?)
    }

    async fn user_progress(&self, _scope: &PersistenceScope) -> anyhow::Result<Value> {
        self.record("user_progress", json!({"score": 0.0}))
    }

    async fn mark_completed(&self, _scope: &PersistenceScope) -> anyhow::Result<Value> {
        self.record("mark_completed", json!({"completed": true}))
    }

    async fn increment_attempts(&self, _scope: &PersistenceScope) -> anyhow::Result<Value> {
        self.record("increment_attempts", json!({"attempts": 2}))
    }

    async fn user_public_profile(&self, user_id: &str) -> anyhow::Result<Value> {
        self.record("user_public_profile", json!({"userId": user_id}))
    }

    async fn generate_image(&self, lesson_id: &str, request: &ImageRequest) -> anyhow::Result<Value> {
        self.record(
            "generate_image",
            json!({"lessonId": lesson_id, "prompt": request.prompt}),
        )
    }

    async fn lesson_images(&self, _lesson_id: &str) -> anyhow::Result<Value> {
        self.record("lesson_images", json!([]))
    }

    async fn lesson_image_ids(&self, _lesson_id: &str) -> anyhow::Result<Value> {
        self.record("lesson_image_ids", json!(["img-1"]))
    }

    async fn delete_image(&self, _lesson_id: &str, image_id: &str) -> anyhow::Result<Value> {
        self.record("delete_image", json!({"deleted": image_id}))
    }
}
