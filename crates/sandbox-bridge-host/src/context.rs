//! The single active interaction context and its push-event observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use sandbox_bridge_core::error::{BridgeError, Result};
use sandbox_bridge_core::types::{
    AiResponse, Identity, InteractionAction, InteractionContext, InteractionEvent, InteractionIds,
    PushEvent, RealtimeMessage,
};

use crate::capabilities::RealtimeChannel;

pub type ResponseObserver = Arc<dyn Fn(&AiResponse) + Send + Sync>;
pub type ActionObserver = Arc<dyn Fn(&InteractionAction) + Send + Sync>;

/// Handle returned by observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Observers {
    responses: Vec<(ObserverId, ResponseObserver)>,
    actions: Vec<(ObserverId, ActionObserver)>,
}

/// Owns the active [`InteractionContext`] and publishes on the real-time channel.
pub struct ContextStore {
    current: RwLock<Option<InteractionContext>>,
    observers: Mutex<Observers>,
    next_observer: AtomicU64,
    realtime: Arc<dyn RealtimeChannel>,
    identity: Identity,
    ai_timeout: Duration,
}

impl ContextStore {
    pub fn new(realtime: Arc<dyn RealtimeChannel>, identity: Identity, ai_timeout: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            observers: Mutex::new(Observers::default()),
            next_observer: AtomicU64::new(1),
            realtime,
            identity,
            ai_timeout,
        }
    }

    /// Install a fresh context. Returns the ids of the context it replaced.
    pub fn initialize(&self, ids: InteractionIds) -> Option<InteractionIds> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let previous = current.take().map(|ctx| ctx.ids);
        info!(
            lesson_id = %ids.lesson_id,
            substage_id = %ids.substage_id,
            interaction_id = %ids.interaction_id,
            "Interaction context initialized"
        );
        *current = Some(InteractionContext::new(ids));
        previous
    }

    /// Drop the active context and its state.
    pub fn destroy(&self) -> Option<InteractionContext> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ctx) = &previous {
            info!(interaction_id = %ctx.ids.interaction_id, "Interaction context destroyed");
        }
        previous
    }

    pub fn is_active(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn ids(&self) -> Option<InteractionIds> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|ctx| ctx.ids.clone())
    }

    pub fn update_state(&self, key: &str, value: Value) -> Result<()> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let ctx = current.as_mut().ok_or(BridgeError::NotInitialized)?;
        ctx.state.insert(key.to_string(), value);
        Ok(())
    }

    /// Merge several keys at once.
    pub fn merge_state(&self, updates: Map<String, Value>) -> Result<()> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let ctx = current.as_mut().ok_or(BridgeError::NotInitialized)?;
        ctx.state.extend(updates);
        Ok(())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<Value>> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        let ctx = current.as_ref().ok_or(BridgeError::NotInitialized)?;
        Ok(ctx.state.get(key).cloned())
    }

    pub fn state_snapshot(&self) -> Result<Map<String, Value>> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        let ctx = current.as_ref().ok_or(BridgeError::NotInitialized)?;
        Ok(ctx.state_snapshot())
    }

    /// Publish a telemetry event. Never fails: with no context, or when the
    /// channel rejects the publish, the event is dropped with a warning.
    pub async fn emit_event(
        &self,
        mut event: InteractionEvent,
        processed_content_id: Option<String>,
    ) -> bool {
        let message = {
            let current = self.current.read().unwrap_or_else(|e| e.into_inner());
            let Some(ctx) = current.as_ref() else {
                warn!(event_type = %event.event_type, "No active interaction, dropping event");
                return false;
            };
            event.timestamp.get_or_insert_with(Utc::now);
            let mut context = ctx.ids.clone();
            if processed_content_id.is_some() {
                context.processed_content_id = processed_content_id;
            }
            RealtimeMessage::InteractionEvent {
                context,
                event,
                state: ctx.state_snapshot(),
                identity: self.identity.clone(),
            }
        };

        match self.realtime.publish(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to publish interaction event");
                false
            }
        }
    }

    fn next_observer_id(&self) -> ObserverId {
        ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_response<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&AiResponse) + Send + Sync + 'static,
    {
        let id = self.next_observer_id();
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.responses.push((id, Arc::new(observer)));
        id
    }

    pub fn on_action<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&InteractionAction) + Send + Sync + 'static,
    {
        let id = self.next_observer_id();
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.actions.push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = observers.responses.len() + observers.actions.len();
        observers.responses.retain(|(oid, _)| *oid != id);
        observers.actions.retain(|(oid, _)| *oid != id);
        before != observers.responses.len() + observers.actions.len()
    }

    pub fn observer_count(&self) -> usize {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.responses.len() + observers.actions.len()
    }

    /// Fan a push event out to the matching observers. Returns how many ran.
    pub fn handle_push(&self, event: &PushEvent) -> usize {
        // Snapshot first so observers may (un)register without deadlocking.
        let (responses, actions) = {
            let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            (
                observers
                    .responses
                    .iter()
                    .map(|(_, f)| f.clone())
                    .collect::<Vec<_>>(),
                observers
                    .actions
                    .iter()
                    .map(|(_, f)| f.clone())
                    .collect::<Vec<_>>(),
            )
        };

        match event {
            PushEvent::Response(response) => {
                for observer in &responses {
                    observer(response);
                }
                debug!(delivered = responses.len(), "AI response fanned out");
                responses.len()
            }
            PushEvent::Action(action) => {
                for observer in &actions {
                    observer(action);
                }
                debug!(action = %action.action, delivered = actions.len(), "Action fanned out");
                actions.len()
            }
        }
    }

    /// Publish a prompt and wait for the next response addressed to the
    /// active interaction, bounded by the configured timeout.
    pub async fn request_ai_response(&self, prompt: &str) -> Result<AiResponse> {
        let ids = self.ids().ok_or(BridgeError::NotInitialized)?;

        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let interaction_id = ids.interaction_id.clone();
        let observer = self.on_response(move |response| {
            if response
                .interaction_id
                .as_deref()
                .is_some_and(|id| id != interaction_id)
            {
                return;
            }
            if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(response.clone());
            }
        });

        let message = RealtimeMessage::AiRequest {
            context: ids,
            prompt: prompt.to_string(),
            identity: self.identity.clone(),
        };
        if let Err(e) = self.realtime.publish(message).await {
            self.remove_observer(observer);
            return Err(BridgeError::RemoteFailure(format!("{e:#}")));
        }

        let outcome = tokio::time::timeout(self.ai_timeout, rx).await;
        self.remove_observer(observer);
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BridgeError::Cancelled("ai response".into())),
            Err(_) => Err(BridgeError::Timeout {
                request_id: "ai response".into(),
                after_ms: self.ai_timeout.as_millis() as u64,
            }),
        }
    }
}
