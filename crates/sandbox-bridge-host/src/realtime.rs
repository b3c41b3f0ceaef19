//! Real-time pub/sub channel implementations.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sandbox_bridge_core::config::RealtimeConfig;
use sandbox_bridge_core::types::{PushEvent, RealtimeMessage};

use crate::capabilities::RealtimeChannel;

/// In-process channel. Published messages are broadcast to local subscribers.
pub struct LoopbackRealtime {
    tx: broadcast::Sender<RealtimeMessage>,
}

impl LoopbackRealtime {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeMessage> {
        self.tx.subscribe()
    }
}

impl Default for LoopbackRealtime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeChannel for LoopbackRealtime {
    async fn publish(&self, message: RealtimeMessage) -> anyhow::Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(message);
        Ok(())
    }
}

/// WebSocket client to the real-time service. Outbound messages are queued to
/// a writer task; inbound frames are decoded into [`PushEvent`]s.
pub struct WsRealtimeChannel {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl WsRealtimeChannel {
    pub async fn connect(
        config: &RealtimeConfig,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<PushEvent>)> {
        let mut request = config.url.as_str().into_client_request()?;
        if let Some(token) = config.resolve_token() {
            request
                .headers_mut()
                .insert("authorization", format!("Bearer {token}").parse()?);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        info!(url = %config.url, "Connected to real-time channel");
        let (mut ws_tx, mut ws_rx) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    msg = outbound_rx.recv() => {
                        let Some(text) = msg else { break };
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            error!(%e, "Real-time channel write failed");
                            break;
                        }
                    }
                }
            }
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = ws_rx.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<PushEvent>(text.as_str()) {
                            Ok(event) => {
                                if push_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(%e, "Unrecognised real-time frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Real-time channel closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(%e, "Real-time channel error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        });

        Ok((Self { outbound, cancel }, push_rx))
    }
}

#[async_trait]
impl RealtimeChannel for WsRealtimeChannel {
    async fn publish(&self, message: RealtimeMessage) -> anyhow::Result<()> {
        let text = serde_json::to_string(&message)?;
        self.outbound
            .send(text)
            .map_err(|_| anyhow::anyhow!("Real-time channel is closed"))?;
        debug!("Queued real-time message");
        Ok(())
    }
}

impl Drop for WsRealtimeChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
