//! Pending-request map: `requestId -> one-shot resolver`.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use sandbox_bridge_core::protocol::Envelope;

#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for `request_id`. Re-registering an id drops the
    /// previous resolver, which its waiter observes as cancellation.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if pending.insert(request_id.to_string(), tx).is_some() {
            debug!(request_id, "Replaced pending request");
        }
        rx
    }

    /// Route a reply to its resolver. The entry is removed first, so a second
    /// reply with the same id finds nothing.
    pub fn resolve(&self, envelope: Envelope) -> bool {
        let Some(request_id) = envelope.request_id.clone() else {
            return false;
        };
        let tx = {
            let mut pending = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&request_id)
        };
        match tx {
            Some(tx) => tx.send(envelope).is_ok(),
            None => {
                debug!(request_id = %request_id, "Reply with no pending request");
                false
            }
        }
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        let mut pending = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        let pending = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every resolver; waiters see their channel close.
    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(id: &str) -> Envelope {
        Envelope::ack("ai-sdk-get-state", Some(id), json!({"state": {"foo": 1}}))
    }

    #[tokio::test]
    async fn test_resolves_once_then_removed() {
        let pending = PendingRequests::new();
        let rx = pending.register("req-1");
        assert!(pending.contains("req-1"));

        assert!(pending.resolve(reply("req-1")));
        assert!(!pending.contains("req-1"));
        let got = rx.await.unwrap();
        assert_eq!(got.get("state"), Some(&json!({"foo": 1})));

        // Replay of the same id hits nothing.
        assert!(!pending.resolve(reply("req-1")));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_closes_waiter() {
        let pending = PendingRequests::new();
        let rx = pending.register("req-2");
        assert!(pending.cancel("req-2"));
        assert!(rx.await.is_err());
        assert!(!pending.resolve(reply("req-2")));
    }

    #[test]
    fn test_unrelated_reply_ignored() {
        let pending = PendingRequests::new();
        let _rx = pending.register("req-3");
        assert!(!pending.resolve(reply("req-4")));
        assert!(!pending.resolve(Envelope::new("ai-sdk-ready")));
        assert_eq!(pending.len(), 1);
    }
}
