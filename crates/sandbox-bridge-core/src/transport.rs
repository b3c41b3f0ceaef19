//! Message ports between the host and one sandboxed interaction.
//!
//! A port pair is the in-process stand-in for a dedicated `MessageChannel`:
//! each end stamps its own origin on every frame it posts, and the receiving
//! side decides whether to trust that origin.

use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};
use crate::protocol::Envelope;

/// One message in flight, tagged with the origin of the sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub origin: String,
    pub envelope: Envelope,
}

/// Sending half of a port.
#[derive(Debug, Clone)]
pub struct PortSender {
    origin: String,
    tx: mpsc::UnboundedSender<Frame>,
}

impl PortSender {
    pub fn new(origin: &str, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            origin: origin.to_string(),
            tx,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn post(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(Frame {
                origin: self.origin.clone(),
                envelope,
            })
            .map_err(|_| BridgeError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a port.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl PortReceiver {
    pub fn new(rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

/// One end of a port pair.
#[derive(Debug)]
pub struct MessagePort {
    pub sender: PortSender,
    pub receiver: PortReceiver,
}

impl MessagePort {
    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

/// Create a connected pair: `(host end, client end)`.
pub fn message_channel(host_origin: &str, client_origin: &str) -> (MessagePort, MessagePort) {
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();

    let host = MessagePort {
        sender: PortSender::new(host_origin, to_client_tx),
        receiver: PortReceiver::new(to_host_rx),
    };
    let client = MessagePort {
        sender: PortSender::new(client_origin, to_host_tx),
        receiver: PortReceiver::new(to_client_rx),
    };
    (host, client)
}

/// Trusted-origin allowlist.
#[derive(Debug, Clone, Default)]
pub struct OriginAllowlist {
    origins: Vec<String>,
}

impl OriginAllowlist {
    pub fn new(origins: impl IntoIterator<Item = String>) -> Self {
        Self {
            origins: origins
                .into_iter()
                .map(|o| normalize_origin(&o))
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    /// Exact match after normalisation. `*` entries are never honoured.
    pub fn allows(&self, origin: &str) -> bool {
        let origin = normalize_origin(origin);
        if origin.is_empty() || origin == "*" || origin == "null" {
            return false;
        }
        self.origins.iter().any(|o| *o == origin)
    }

    pub fn check(&self, origin: &str) -> Result<()> {
        if self.allows(origin) {
            Ok(())
        } else {
            Err(BridgeError::OriginRejected(origin.to_string()))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn origins(&self) -> &[String] {
        &self.origins
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
