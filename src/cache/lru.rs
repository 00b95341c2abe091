//! LRU Tracker Module
//!
//! Least Recently Used ordering for near-cache eviction.

use std::collections::VecDeque;

use crate::serialization::Data;

// == LRU Tracker ==
/// Tracks access order of near-cache keys.
///
/// Front = most recently used, back = least recently used.
#[derive(Debug, Default)]
pub struct LruTracker {
    order: VecDeque<Data>,
}

impl LruTracker {
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
        }
    }

    // == Touch ==
    /// Marks a key as recently used (moves to front).
    pub fn touch(&mut self, key: &Data) {
        self.remove(key);
        self.order.push_front(key.clone());
    }

    // == Remove ==
    pub fn remove(&mut self, key: &Data) {
        self.order.retain(|k| k != key);
    }

    // == Evict Oldest ==
    /// Returns and removes the least recently used key.
    pub fn evict_oldest(&mut self) -> Option<Data> {
        self.order.pop_back()
    }

    pub fn peek_oldest(&self) -> Option<&Data> {
        self.order.back()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &Data) -> bool {
        self.order.iter().any(|k| k == key)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &'static str) -> Data {
        Data::from_bytes(name.as_bytes())
    }

    #[test]
    fn test_lru_touch_existing_key() {
        let mut lru = LruTracker::new();

        lru.touch(&key("key1"));
        lru.touch(&key("key2"));
        lru.touch(&key("key3"));
        lru.touch(&key("key1"));

        assert_eq!(lru.len(), 3);
        assert_eq!(lru.peek_oldest(), Some(&key("key2")));
    }

    #[test]
    fn test_lru_evict_order() {
        let mut lru = LruTracker::new();

        lru.touch(&key("a"));
        lru.touch(&key("b"));
        lru.touch(&key("c"));
        lru.touch(&key("a"));

        assert_eq!(lru.evict_oldest(), Some(key("b")));
        assert_eq!(lru.evict_oldest(), Some(key("c")));
        assert_eq!(lru.evict_oldest(), Some(key("a")));
        assert_eq!(lru.evict_oldest(), None);
    }

    #[test]
    fn test_lru_remove_and_clear() {
        let mut lru = LruTracker::new();

        lru.touch(&key("key1"));
        lru.touch(&key("key2"));
        lru.remove(&key("key1"));
        lru.remove(&key("nonexistent"));

        assert!(!lru.contains(&key("key1")));
        assert!(lru.contains(&key("key2")));

        lru.clear();
        assert!(lru.is_empty());
    }
}
