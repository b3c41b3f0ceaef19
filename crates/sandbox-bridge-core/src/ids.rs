//! Correlation and subscription id generation.
//!
//! Ids combine a millisecond timestamp, a per-session random salt and a
//! monotonic counter, so two sessions started in the same millisecond (or
//! after a reload) cannot mint the same id.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

#[derive(Debug)]
pub struct IdGenerator {
    prefix: &'static str,
    salt: String,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            salt: format!("{:08x}", rand::random::<u32>()),
            counter: AtomicU64::new(0),
        }
    }

    /// Generator for request correlation ids (`req-...`).
    pub fn requests() -> Self {
        Self::new("req")
    }

    /// Generator for subscription ids (`sub-...`).
    pub fn subscriptions() -> Self {
        Self::new("sub")
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!(
            "{}-{}-{}-{n}",
            self.prefix,
            Utc::now().timestamp_millis(),
            self.salt
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_ids_unique_within_session() {
        let ids = IdGenerator::requests();
        let set: HashSet<String> = (0..1000).map(|_| ids.next_id()).collect();
        assert_eq!(set.len(), 1000);
    }

    #[test]
    fn test_id_shape() {
        let ids = IdGenerator::subscriptions();
        let id = ids.next_id();
        assert!(id.starts_with("sub-"));
        assert!(id.contains(ids.salt()));
        assert!(id.ends_with("-1"));
    }

    #[test]
    fn test_sessions_are_salted() {
        // Same counter value, same millisecond: only the salt separates them.
        let a = IdGenerator::requests();
        let b = IdGenerator::requests();
        if a.salt() != b.salt() {
            assert_ne!(a.next_id(), b.next_id());
        }
    }
}
