//! Registry of live response subscriptions, keyed by subscription id.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use sandbox_bridge_core::error::{BridgeError, Result};

pub type Unsubscribe = Box<dyn FnOnce() + Send>;

struct Entry {
    channel_id: String,
    unsubscribe: Unsubscribe,
}

/// Each entry remembers the channel that created it so teardown of one
/// channel never touches another's subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. An existing entry under the same id owned by
    /// the same channel is unsubscribed first; one owned by another channel
    /// is left alone and the insert is refused.
    pub fn insert(
        &self,
        subscription_id: &str,
        channel_id: &str,
        unsubscribe: Unsubscribe,
    ) -> Result<()> {
        let replaced = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let foreign = entries
                .get(subscription_id)
                .is_some_and(|existing| existing.channel_id != channel_id);
            if foreign {
                warn!(subscription_id, channel_id, "Subscription id owned by another channel");
                return Err(BridgeError::InvalidParams(format!(
                    "subscriptionId {subscription_id} is already in use"
                )));
            }
            entries.insert(
                subscription_id.to_string(),
                Entry {
                    channel_id: channel_id.to_string(),
                    unsubscribe,
                },
            )
        };
        if let Some(old) = replaced {
            debug!(subscription_id, "Replacing existing subscription");
            (old.unsubscribe)();
        }
        Ok(())
    }

    /// Remove a subscription owned by `channel_id`.
    pub fn remove(&self, subscription_id: &str, channel_id: &str) -> bool {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(subscription_id) {
                Some(entry) if entry.channel_id == channel_id => entries.remove(subscription_id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                (entry.unsubscribe)();
                true
            }
            None => false,
        }
    }

    /// Remove every subscription created through `channel_id`.
    pub fn remove_channel(&self, channel_id: &str) -> usize {
        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.channel_id == channel_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = removed.len();
        for entry in removed {
            (entry.unsubscribe)();
        }
        if count > 0 {
            debug!(channel_id, count, "Removed channel subscriptions");
        }
        count
    }

    pub fn clear(&self) -> usize {
        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain().map(|(_, e)| e).collect()
        };
        let count = removed.len();
        for entry in removed {
            (entry.unsubscribe)();
        }
        count
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(subscription_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Unsubscribe) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }) as Unsubscribe
        })
    }

    #[test]
    fn test_remove_respects_owner() {
        let (count, make) = counter();
        let registry = SubscriptionRegistry::new();
        registry.insert("sub-1", "chan-a", make()).unwrap();

        assert!(!registry.remove("sub-1", "chan-b"));
        assert!(registry.contains("sub-1"));
        assert!(registry.remove("sub-1", "chan-a"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registry.remove("sub-1", "chan-a"));
    }

    #[test]
    fn test_replace_unsubscribes_previous() {
        let (count, make) = counter();
        let registry = SubscriptionRegistry::new();
        registry.insert("sub-1", "chan-a", make()).unwrap();
        registry.insert("sub-1", "chan-a", make()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_insert_refuses_id_owned_by_another_channel() {
        let (count, make) = counter();
        let registry = SubscriptionRegistry::new();
        registry.insert("sub-1", "chan-a", make()).unwrap();

        let err = registry.insert("sub-1", "chan-b", make()).unwrap_err();
        assert_eq!(err.code(), "invalid_params");
        // The original owner's subscription is untouched.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!registry.remove("sub-1", "chan-b"));
        assert!(registry.remove("sub-1", "chan-a"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_teardown_is_scoped() {
        let (count, make) = counter();
        let registry = SubscriptionRegistry::new();
        registry.insert("sub-1", "chan-a", make()).unwrap();
        registry.insert("sub-2", "chan-a", make()).unwrap();
        registry.insert("sub-3", "chan-b", make()).unwrap();

        assert_eq!(registry.remove_channel("chan-a"), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(registry.contains("sub-3"));

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
    }
}
