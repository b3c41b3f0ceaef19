//! Channel lifecycle: mount, per-channel read loop, initialise and destroy.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sandbox_bridge_core::config::Config;
use sandbox_bridge_core::error::Result;
use sandbox_bridge_core::protocol::{Envelope, LifecycleEvent, MessageKind};
use sandbox_bridge_core::transport::{message_channel, MessagePort, PortReceiver, PortSender};
use sandbox_bridge_core::types::{InteractionIds, PushEvent};

use crate::capabilities::{PersistenceApi, RealtimeChannel};
use crate::context::ContextStore;
use crate::events::send_lifecycle;
use crate::facade::SdkFacade;
use crate::methods::dispatch_message;
use crate::state::{ChannelState, HostState};

/// Host-side bridge. Owns every mounted channel and the single active context.
#[derive(Clone)]
pub struct HostBridge {
    state: Arc<HostState>,
}

impl HostBridge {
    pub fn new(
        config: Arc<Config>,
        realtime: Arc<dyn RealtimeChannel>,
        api: Arc<dyn PersistenceApi>,
    ) -> Self {
        Self {
            state: Arc::new(HostState::new(config, realtime, api)),
        }
    }

    pub fn state(&self) -> &Arc<HostState> {
        &self.state
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.state.context
    }

    pub fn facade(&self) -> &Arc<SdkFacade> {
        &self.state.facade
    }

    /// Mount an interaction loaded from `origin`. Returns the channel id and
    /// the client end of a dedicated port.
    pub async fn mount(&self, interaction_id: &str, origin: &str) -> Result<(String, MessagePort)> {
        self.state.origins.check(origin)?;
        let (host_end, client_end) = message_channel(&self.state.host_origin, origin);
        let channel_id = self.attach(interaction_id, origin, host_end).await;
        Ok((channel_id, client_end))
    }

    /// Register a host port end and start its read loop. If the interaction
    /// is already the active context, `ready` is sent immediately.
    pub async fn attach(&self, interaction_id: &str, origin: &str, port: MessagePort) -> String {
        let channel_id = Uuid::new_v4().to_string();
        let (sender, receiver) = port.split();

        {
            let mut channels = self.state.channels.write().await;
            channels.insert(
                channel_id.clone(),
                ChannelState {
                    channel_id: channel_id.clone(),
                    interaction_id: interaction_id.to_string(),
                    origin: origin.to_string(),
                    sender: sender.clone(),
                    mounted_at: Utc::now(),
                },
            );
        }
        info!(channel_id = %channel_id, interaction_id, origin, "Interaction channel mounted");

        if let Some(ids) = self.state.context.ids() {
            if ids.interaction_id == interaction_id {
                let _ = sender.post(LifecycleEvent::Ready(ids).to_envelope());
            }
        }

        tokio::spawn(run_channel(
            self.state.clone(),
            channel_id.clone(),
            origin.to_string(),
            sender,
            receiver,
        ));
        channel_id
    }

    /// Remove a channel and every subscription it created.
    pub async fn unmount(&self, channel_id: &str) -> bool {
        cleanup_channel(&self.state, channel_id).await
    }

    /// Make `ids` the active context and signal `ready` to its channels. A
    /// different previously active interaction is torn down first.
    pub async fn initialize(&self, ids: InteractionIds) -> usize {
        if let Some(previous) = self.state.context.initialize(ids.clone()) {
            if previous.interaction_id != ids.interaction_id {
                self.state.subscriptions.clear();
                send_lifecycle(
                    &self.state,
                    &LifecycleEvent::Destroyed(Some(previous.clone())),
                    &previous.interaction_id,
                )
                .await;
            }
        }
        let interaction_id = ids.interaction_id.clone();
        send_lifecycle(&self.state, &LifecycleEvent::Ready(ids), &interaction_id).await
    }

    /// Drop the active context, clear subscriptions and signal `destroyed`.
    pub async fn destroy(&self) -> usize {
        let removed = self.state.subscriptions.clear();
        let Some(previous) = self.state.context.destroy() else {
            debug!("Destroy with no active context");
            return 0;
        };
        debug!(removed, "Subscriptions cleared on destroy");
        let interaction_id = previous.ids.interaction_id.clone();
        send_lifecycle(
            &self.state,
            &LifecycleEvent::Destroyed(Some(previous.ids)),
            &interaction_id,
        )
        .await
    }

    /// Deliver a push event from the real-time channel: fan out to observers,
    /// then apply the display policy to AI responses when enabled.
    pub fn handle_push(&self, event: PushEvent) {
        self.state.context.handle_push(&event);
        if let PushEvent::Response(response) = &event {
            if self.state.config.auto_display() {
                if let Err(e) = self.state.facade.display_response(response) {
                    debug!(code = e.code(), "AI response not displayed");
                }
            }
        }
    }

    /// Feed push events from a real-time receiver until it closes.
    pub fn spawn_push_pump(&self, mut pushes: mpsc::UnboundedReceiver<PushEvent>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(event) = pushes.recv().await {
                bridge.handle_push(event);
            }
            debug!("Push event stream ended");
        })
    }

    pub async fn channel_count(&self) -> usize {
        self.state.channels.read().await.len()
    }
}

/// Per-channel read loop. Short requests run in order; long-running ones are
/// spawned so they cannot block the channel.
async fn run_channel(
    state: Arc<HostState>,
    channel_id: String,
    origin: String,
    sender: PortSender,
    mut receiver: PortReceiver,
) {
    while let Some(frame) = receiver.recv().await {
        if frame.origin != origin || !state.origins.allows(&frame.origin) {
            warn!(channel_id = %channel_id, origin = %frame.origin, "Dropping frame from untrusted origin");
            continue;
        }
        if !frame.envelope.is_namespaced() {
            debug!(kind = %frame.envelope.kind, "Ignoring non-bridge message");
            continue;
        }

        let long_running = frame
            .envelope
            .kind
            .parse::<MessageKind>()
            .map(|k| k.is_long_running())
            .unwrap_or(false);

        if long_running {
            let state = state.clone();
            let channel_id = channel_id.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                if let Some(reply) = dispatch_message(&state, &channel_id, frame.envelope).await {
                    post_reply(&sender, &channel_id, reply);
                }
            });
        } else if let Some(reply) = dispatch_message(&state, &channel_id, frame.envelope).await {
            post_reply(&sender, &channel_id, reply);
        }
    }

    cleanup_channel(&state, &channel_id).await;
    info!(channel_id = %channel_id, "Interaction channel closed");
}

fn post_reply(sender: &PortSender, channel_id: &str, reply: Envelope) {
    if sender.post(reply).is_err() {
        debug!(channel_id, "Reply dropped, channel closed");
    }
}

async fn cleanup_channel(state: &Arc<HostState>, channel_id: &str) -> bool {
    let removed = state.channels.write().await.remove(channel_id).is_some();
    if removed {
        state.subscriptions.remove_channel(channel_id);
    }
    removed
}
