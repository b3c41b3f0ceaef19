//! Host shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use sandbox_bridge_core::config::Config;
use sandbox_bridge_core::transport::{OriginAllowlist, PortSender};

use crate::capabilities::{PersistenceApi, RealtimeChannel};
use crate::context::ContextStore;
use crate::facade::SdkFacade;
use crate::subscriptions::SubscriptionRegistry;

/// Shared host state accessible from every channel loop and handler.
pub struct HostState {
    pub config: Arc<Config>,
    pub origins: OriginAllowlist,
    pub host_origin: String,
    pub context: Arc<ContextStore>,
    pub facade: Arc<SdkFacade>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub channels: RwLock<HashMap<String, ChannelState>>,
}

/// One mounted interaction channel.
pub struct ChannelState {
    pub channel_id: String,
    pub interaction_id: String,
    pub origin: String,
    pub sender: PortSender,
    pub mounted_at: DateTime<Utc>,
}

impl HostState {
    pub fn new(
        config: Arc<Config>,
        realtime: Arc<dyn RealtimeChannel>,
        api: Arc<dyn PersistenceApi>,
    ) -> Self {
        let identity = config.identity();
        let context = Arc::new(ContextStore::new(
            realtime,
            identity.clone(),
            config.ai_response_timeout(),
        ));
        Self {
            origins: config.allowed_origins(),
            host_origin: config.host_origin(),
            context,
            facade: Arc::new(SdkFacade::new(api, identity)),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            channels: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Sender for a mounted channel, if it is still mounted.
    pub async fn channel_sender(&self, channel_id: &str) -> Option<PortSender> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .map(|c| c.sender.clone())
    }

    pub async fn channel_interaction(&self, channel_id: &str) -> Option<String> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .map(|c| c.interaction_id.clone())
    }
}
