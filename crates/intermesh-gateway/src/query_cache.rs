//! Transient store for QUERY responses awaiting a synchronous caller.
//!
//! Entries are consumed on read and expire after a fixed TTL; expired
//! entries are purged on every insert and every read.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use intermesh_types::MessageEnvelope;
use tracing::debug;

#[derive(Debug)]
pub struct QueryCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, MessageEnvelope)>>,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store the response for `conversation_id`, replacing any earlier one.
    pub fn insert(&self, conversation_id: impl Into<String>, envelope: MessageEnvelope) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut entries);
        entries.insert(conversation_id.into(), (Instant::now(), envelope));
    }

    /// Remove and return the response for `conversation_id`, if it is still
    /// fresh.
    pub fn take(&self, conversation_id: &str) -> Option<MessageEnvelope> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge(&mut entries);
        entries.remove(conversation_id).map(|(_, env)| env)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self, entries: &mut HashMap<String, (Instant, MessageEnvelope)>) {
        let before = entries.len();
        entries.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "expired query responses purged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intermesh_types::MessageType;

    fn response(conv: &str) -> MessageEnvelope {
        MessageEnvelope::new([MessageType::Query, MessageType::Response], conv)
    }

    #[test]
    fn take_consumes_the_entry() {
        let cache = QueryCache::new(Duration::from_secs(60));
        cache.insert("conv-q", response("conv-q"));

        assert_eq!(cache.take("conv-q").map(|e| e.conversation_id), Some("conv-q".to_string()));
        assert!(cache.take("conv-q").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_are_purged_on_insert_and_read() {
        let cache = QueryCache::new(Duration::from_millis(20));
        cache.insert("old", response("old"));
        std::thread::sleep(Duration::from_millis(40));

        cache.insert("new", response("new"));
        assert_eq!(cache.len(), 1, "insert must purge the stale entry");
        assert!(cache.take("old").is_none());
        assert!(cache.take("new").is_some());
    }
}
