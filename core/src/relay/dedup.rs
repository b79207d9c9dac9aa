//! Dedup cache — time-bounded relay-loop suppression
//!
//! Maps a message identity to the peer that first delivered it. Entries
//! older than the TTL are purged before any membership check; the cache is
//! loop prevention, not durable history.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct DedupEntry {
    origin_peer_id: u32,
    received_at: Instant,
}

pub struct DedupCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, DedupEntry>>,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .lock()
            .retain(|_, e| e.received_at.elapsed() < ttl);
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.purge_expired();
        self.entries.lock().contains_key(identity)
    }

    /// The peer that first delivered this identity, used to route relay
    /// acknowledgments back along the flood path.
    pub fn origin_of(&self, identity: &str) -> Option<u32> {
        self.purge_expired();
        self.entries
            .lock()
            .get(identity)
            .map(|e| e.origin_peer_id)
    }

    pub fn insert(&self, identity: String, origin_peer_id: u32) {
        self.entries.lock().insert(
            identity,
            DedupEntry {
                origin_peer_id,
                received_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(!cache.contains("E1"));

        cache.insert("E1".to_string(), 3);
        assert!(cache.contains("E1"));
        assert_eq!(cache.origin_of("E1"), Some(3));
        assert_eq!(cache.origin_of("E2"), None);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let cache = DedupCache::new(Duration::from_millis(30));
        cache.insert("E1".to_string(), 3);
        assert!(cache.contains("E1"));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!cache.contains("E1"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_reinsert_after_expiry_is_new() {
        let cache = DedupCache::new(Duration::from_millis(30));
        cache.insert("E1".to_string(), 3);
        std::thread::sleep(Duration::from_millis(50));

        cache.insert("E1".to_string(), 9);
        assert_eq!(cache.origin_of("E1"), Some(9));
    }
}
