//! Capability-oriented client surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sandbox_bridge_core::config::Config;
use sandbox_bridge_core::error::{BridgeError, Result};
use sandbox_bridge_core::ids::IdGenerator;
use sandbox_bridge_core::protocol::{Envelope, MessageKind, DESTROYED, READY, RESPONSE};
use sandbox_bridge_core::transport::{MessagePort, PortReceiver, PortSender};
use sandbox_bridge_core::types::{AiResponse, ImageRequest, InteractionIds, Outcome, UserProgress};

use crate::pending::PendingRequests;

/// Handler for durable AI response subscriptions.
pub type ResponseHandler = Arc<dyn Fn(AiResponse) + Send + Sync>;

/// Callback for a single correlated reply.
pub type ReplyCallback = Box<dyn FnOnce(Envelope) + Send>;

/// Extra time granted on top of the host's AI response bound.
const AI_RESPONSE_GRACE: Duration = Duration::from_secs(5);

/// Last lifecycle event observed from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Pending,
    Ready(Option<InteractionIds>),
    Destroyed,
}

struct Inner {
    sender: PortSender,
    pending: PendingRequests,
    request_ids: IdGenerator,
    subscription_ids: IdGenerator,
    subscribers: Mutex<HashMap<String, ResponseHandler>>,
    lifecycle: watch::Sender<Lifecycle>,
    host_origin: Option<String>,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl Inner {
    fn route(&self, envelope: Envelope) {
        match envelope.kind.as_str() {
            READY => {
                let ids = serde_json::from_value::<InteractionIds>(envelope.into_value()).ok();
                debug!(?ids, "Host ready");
                self.lifecycle.send_replace(Lifecycle::Ready(ids));
            }
            DESTROYED => {
                debug!("Host destroyed context");
                self.lifecycle.send_replace(Lifecycle::Destroyed);
            }
            RESPONSE => self.deliver_response(envelope),
            _ => {
                if envelope.request_id.is_some() {
                    self.pending.resolve(envelope);
                } else {
                    debug!(kind = %envelope.kind, "Ignoring uncorrelated message");
                }
            }
        }
    }

    fn deliver_response(&self, envelope: Envelope) {
        let Some(subscription_id) = envelope.subscription_id.as_deref() else {
            debug!("Response push without subscription id");
            return;
        };
        let handler = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.get(subscription_id).cloned()
        };
        let Some(handler) = handler else {
            debug!(subscription_id, "Response for unknown subscription");
            return;
        };
        match envelope
            .get("response")
            .cloned()
            .map(serde_json::from_value::<AiResponse>)
        {
            Some(Ok(response)) => handler(response),
            Some(Err(e)) => warn!(subscription_id, %e, "Malformed response push"),
            None => warn!(subscription_id, "Response push without payload"),
        }
    }

    fn post(&self, envelope: Envelope) -> Result<()> {
        self.sender.post(envelope)
    }
}

/// Client bound to one host port.
pub struct InteractionClient {
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
}

impl InteractionClient {
    /// Bind a client to `port`. Frames whose origin is not `host_origin` are
    /// dropped; `None` trusts whatever the port delivers.
    pub fn new(port: MessagePort, host_origin: Option<&str>, request_timeout: Duration) -> Self {
        let (sender, receiver) = port.split();
        let (lifecycle, _) = watch::channel(Lifecycle::Pending);
        let inner = Arc::new(Inner {
            sender,
            pending: PendingRequests::new(),
            request_ids: IdGenerator::requests(),
            subscription_ids: IdGenerator::subscriptions(),
            subscribers: Mutex::new(HashMap::new()),
            lifecycle,
            host_origin: host_origin.map(String::from),
            request_timeout,
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(inner.clone(), receiver));
        Self { inner, reader }
    }

    pub fn from_config(port: MessagePort, config: &Config) -> Self {
        let host_origin = config.client.as_ref().and_then(|c| c.host_origin.clone());
        Self::new(port, host_origin.as_deref(), config.request_timeout())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle.borrow().clone()
    }

    /// Wait for the host's ready event on this channel.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<Option<InteractionIds>> {
        let mut rx = self.inner.lifecycle.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|l| matches!(l, Lifecycle::Ready(_))),
        )
        .await;
        match waited {
            Ok(Ok(state)) => match &*state {
                Lifecycle::Ready(ids) => Ok(ids.clone()),
                _ => Err(BridgeError::NotInitialized),
            },
            Ok(Err(_)) => Err(BridgeError::ChannelClosed),
            Err(_) => Err(BridgeError::Timeout {
                request_id: READY.to_string(),
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    // ============================================================
    // Messaging primitives
    // ============================================================

    /// Post `{type, requestId, ...data}`. With a callback, the first reply
    /// carrying the same `requestId` is handed to it; after the request
    /// timeout the resolver is dropped and the callback never runs.
    pub fn send_message(
        &self,
        kind: MessageKind,
        data: Value,
        callback: Option<ReplyCallback>,
    ) -> Result<String> {
        let request_id = self.inner.request_ids.next_id();
        let envelope = Envelope::request(kind, &request_id, data);

        let Some(callback) = callback else {
            self.inner.post(envelope)?;
            return Ok(request_id);
        };

        let rx = self.inner.pending.register(&request_id);
        if let Err(e) = self.inner.post(envelope) {
            self.inner.pending.cancel(&request_id);
            return Err(e);
        }

        let inner = self.inner.clone();
        let id = request_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(inner.request_timeout, rx).await {
                Ok(Ok(reply)) => callback(reply),
                Ok(Err(_)) => debug!(request_id = %id, "Request cancelled"),
                Err(_) => {
                    inner.pending.cancel(&id);
                    debug!(request_id = %id, "Request timed out");
                }
            }
        });
        Ok(request_id)
    }

    /// Fire-and-forget: no reply is awaited and none is guaranteed.
    pub fn notify(&self, kind: MessageKind, data: Value) -> Result<()> {
        self.send_message(kind, data, None).map(|_| ())
    }

    /// Send a request and await its reply under the uniform timeout.
    pub async fn request(&self, kind: MessageKind, data: Value) -> Result<Envelope> {
        self.request_with_timeout(kind, data, self.inner.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        kind: MessageKind,
        data: Value,
        timeout: Duration,
    ) -> Result<Envelope> {
        let request_id = self.inner.request_ids.next_id();
        let rx = self.inner.pending.register(&request_id);
        if let Err(e) = self
            .inner
            .post(Envelope::request(kind, &request_id, data))
        {
            self.inner.pending.cancel(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => match reply.error() {
                Some(err) => Err(err),
                None => Ok(reply),
            },
            Ok(Err(_)) if self.inner.closed.load(Ordering::Acquire) => {
                Err(BridgeError::ChannelClosed)
            }
            Ok(Err(_)) => Err(BridgeError::Cancelled(request_id)),
            Err(_) => {
                self.inner.pending.cancel(&request_id);
                Err(BridgeError::Timeout {
                    request_id,
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Drop a pending request; its waiter fails with `Cancelled`.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.inner.pending.cancel(request_id)
    }

    // ============================================================
    // Events & state
    // ============================================================

    pub fn emit_event(&self, event_type: &str, data: Value) -> Result<()> {
        self.notify(
            MessageKind::EmitEvent,
            json!({"event": {"type": event_type, "data": data}}),
        )
    }

    pub fn update_state(&self, key: &str, value: Value) -> Result<()> {
        self.notify(MessageKind::UpdateState, json!({"key": key, "value": value}))
    }

    pub async fn get_state(&self) -> Result<Value> {
        let reply = self.request(MessageKind::GetState, Value::Null).await?;
        Ok(reply.get("state").cloned().unwrap_or(Value::Null))
    }

    /// Callback form of [`get_state`](Self::get_state); receives the `state` field.
    pub fn get_state_with<F>(&self, callback: F) -> Result<String>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.send_message(
            MessageKind::GetState,
            Value::Null,
            Some(Box::new(move |reply: Envelope| {
                callback(reply.get("state").cloned().unwrap_or(Value::Null))
            })),
        )
    }

    pub async fn get_state_value(&self, key: &str) -> Result<Option<Value>> {
        let reply = self
            .request(MessageKind::GetState, json!({"key": key}))
            .await?;
        Ok(reply.get("value").cloned().filter(|v| !v.is_null()))
    }

    pub async fn get_context(&self) -> Result<InteractionIds> {
        let reply = self.request(MessageKind::GetContext, Value::Null).await?;
        Ok(serde_json::from_value(reply.into_value())?)
    }

    /// Register a durable handler for AI responses pushed to this interaction.
    pub async fn on_response<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(AiResponse) + Send + Sync + 'static,
    {
        let subscription_id = self.inner.subscription_ids.next_id();
        {
            let mut subscribers = self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.insert(subscription_id.clone(), Arc::new(handler));
        }

        let result = self
            .request(
                MessageKind::Subscribe,
                json!({"subscriptionId": subscription_id}),
            )
            .await;
        if let Err(e) = result {
            let mut subscribers = self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.remove(&subscription_id);
            return Err(e);
        }

        Ok(Subscription {
            id: subscription_id,
            inner: self.inner.clone(),
            active: true,
        })
    }

    pub async fn request_ai_response(&self, prompt: &str) -> Result<AiResponse> {
        let reply = self
            .request_with_timeout(
                MessageKind::RequestAiResponse,
                json!({"prompt": prompt}),
                self.inner.request_timeout.saturating_add(AI_RESPONSE_GRACE),
            )
            .await?;
        let response = reply
            .get("response")
            .cloned()
            .ok_or_else(|| BridgeError::InvalidParams("reply without response".into()))?;
        Ok(serde_json::from_value(response)?)
    }

    // ============================================================
    // Chat & UI control
    // ============================================================

    pub fn minimize_chat_ui(&self) -> Result<()> {
        self.notify(MessageKind::MinimizeChatUi, Value::Null)
    }

    pub fn show_chat_ui(&self) -> Result<()> {
        self.notify(MessageKind::ShowChatUi, Value::Null)
    }

    pub fn activate_fullscreen(&self) -> Result<()> {
        self.notify(MessageKind::ActivateFullscreen, Value::Null)
    }

    pub fn deactivate_fullscreen(&self) -> Result<()> {
        self.notify(MessageKind::DeactivateFullscreen, Value::Null)
    }

    pub fn post_to_chat(&self, content: &str, role: Option<&str>, open_chat: bool) -> Result<()> {
        self.notify(
            MessageKind::PostToChat,
            json!({"content": content, "role": role, "openChat": open_chat}),
        )
    }

    pub fn show_script(&self, content: &str, open_chat: bool) -> Result<()> {
        self.notify(
            MessageKind::ShowScript,
            json!({"content": content, "openChat": open_chat}),
        )
    }

    /// Show a snack notification and return its id.
    pub async fn show_snack(&self, content: &str, duration_ms: Option<u64>) -> Result<String> {
        let reply = self
            .request(
                MessageKind::ShowSnack,
                json!({"content": content, "durationMs": duration_ms}),
            )
            .await?;
        Ok(reply.str_field("snackId").unwrap_or_default().to_string())
    }

    pub fn hide_snack(&self, snack_id: Option<&str>) -> Result<()> {
        self.notify(MessageKind::HideSnack, json!({"snackId": snack_id}))
    }

    pub fn show_overlay(&self, content: Value) -> Result<()> {
        self.notify(MessageKind::ShowOverlay, json!({"content": content}))
    }

    pub fn hide_overlay(&self) -> Result<()> {
        self.notify(MessageKind::HideOverlay, Value::Null)
    }

    // ============================================================
    // Persistence
    // ============================================================

    pub async fn save_instance_data(&self, data: Value) -> Result<Outcome> {
        self.outcome(MessageKind::SaveInstanceData, json!({"data": data}))
            .await
    }

    pub async fn get_instance_data_history(&self, filters: Value) -> Result<Outcome> {
        self.outcome(
            MessageKind::GetInstanceDataHistory,
            json!({"filters": filters}),
        )
        .await
    }

    /// Errors propagate: a lost score must be visible to the caller.
    pub async fn save_user_progress(&self, progress: &UserProgress) -> Result<Value> {
        let reply = self
            .request(
                MessageKind::SaveUserProgress,
                json!({"progress": progress}),
            )
            .await?;
        Ok(reply.get("progress").cloned().unwrap_or(Value::Null))
    }

    pub async fn get_user_progress(&self) -> Result<Value> {
        let reply = self
            .request(MessageKind::GetUserProgress, Value::Null)
            .await?;
        Ok(reply.get("progress").cloned().unwrap_or(Value::Null))
    }

    pub async fn mark_completed(&self) -> Result<Outcome> {
        self.outcome(MessageKind::MarkCompleted, Value::Null).await
    }

    pub async fn increment_attempts(&self) -> Result<Outcome> {
        self.outcome(MessageKind::IncrementAttempts, Value::Null).await
    }

    pub async fn get_user_public_profile(&self, user_id: Option<&str>) -> Result<Outcome> {
        self.outcome(
            MessageKind::GetUserPublicProfile,
            json!({"userId": user_id}),
        )
        .await
    }

    // ============================================================
    // Images
    // ============================================================

    pub async fn generate_image(&self, request: &ImageRequest) -> Result<Outcome> {
        let reply = self
            .request_with_timeout(
                MessageKind::GenerateImage,
                serde_json::to_value(request)?,
                self.inner.request_timeout.saturating_mul(4),
            )
            .await?;
        Ok(serde_json::from_value(reply.into_value())?)
    }

    pub async fn get_lesson_images(&self) -> Result<Outcome> {
        self.outcome(MessageKind::GetLessonImages, Value::Null).await
    }

    pub async fn get_lesson_image_ids(&self) -> Result<Outcome> {
        self.outcome(MessageKind::GetLessonImageIds, Value::Null)
            .await
    }

    pub async fn delete_image(&self, image_id: &str) -> Result<Outcome> {
        self.outcome(MessageKind::DeleteImage, json!({"imageId": image_id}))
            .await
    }

    // ============================================================
    // Media control
    // ============================================================

    pub fn play_media(&self) -> Result<()> {
        self.notify(MessageKind::MediaPlay, Value::Null)
    }

    pub fn pause_media(&self) -> Result<()> {
        self.notify(MessageKind::MediaPause, Value::Null)
    }

    pub fn seek_media(&self, seconds: f64) -> Result<()> {
        self.notify(MessageKind::MediaSeek, json!({"time": seconds}))
    }

    pub fn set_media_volume(&self, volume: f64) -> Result<()> {
        self.notify(MessageKind::MediaVolume, json!({"volume": volume}))
    }

    pub async fn get_media_current_time(&self) -> Result<f64> {
        let reply = self
            .request(MessageKind::MediaCurrentTime, Value::Null)
            .await?;
        Ok(reply.get("currentTime").and_then(|v| v.as_f64()).unwrap_or(0.0))
    }

    pub async fn get_media_duration(&self) -> Result<f64> {
        let reply = self.request(MessageKind::MediaDuration, Value::Null).await?;
        Ok(reply.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0))
    }

    pub async fn is_media_playing(&self) -> Result<bool> {
        let reply = self
            .request(MessageKind::MediaIsPlaying, Value::Null)
            .await?;
        Ok(reply
            .get("isPlaying")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn outcome(&self, kind: MessageKind, data: Value) -> Result<Outcome> {
        let reply = self.request(kind, data).await?;
        Ok(serde_json::from_value(reply.into_value())?)
    }
}

impl Drop for InteractionClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(inner: Arc<Inner>, mut receiver: PortReceiver) {
    while let Some(frame) = receiver.recv().await {
        if let Some(expected) = &inner.host_origin {
            if frame.origin != *expected {
                warn!(origin = %frame.origin, "Dropping frame from untrusted origin");
                continue;
            }
        }
        inner.route(frame.envelope);
    }
    debug!("Host port closed");
    inner.closed.store(true, Ordering::Release);
    inner.pending.clear();
}

/// Handle for a durable response subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    inner: Arc<Inner>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop delivery locally and tell the host to drop the subscription.
    pub fn unsubscribe(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.active, false) {
            return Ok(());
        }
        {
            let mut subscribers = self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.remove(&self.id);
        }
        let request_id = self.inner.request_ids.next_id();
        self.inner.post(Envelope::request(
            MessageKind::Unsubscribe,
            &request_id,
            json!({"subscriptionId": self.id}),
        ))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            debug!(subscription_id = %self.id, %e, "Unsubscribe on drop not delivered");
        }
    }
}
