//! Bounded LRU cache used by the stored-user store

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

/// LRU cache with a fixed capacity
pub struct LruCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
    access_order: RwLock<Vec<K>>,
    max_size: usize,
}

impl<K: Clone + Eq + Hash, V: Clone> LruCache<K, V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            access_order: RwLock::new(Vec::new()),
            max_size: max_size.max(1),
        }
    }

    /// Get a value and mark it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        let value = entries.get(key).cloned()?;

        let mut access = self.access_order.write();
        access.retain(|k| k != key);
        access.push(key.clone());

        Some(value)
    }

    /// Insert a value, evicting the least recently used entry at capacity
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write();
        let mut access = self.access_order.write();

        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            if let Some(lru_key) = access.first().cloned() {
                entries.remove(&lru_key);
                access.remove(0);
            }
        }

        entries.insert(key.clone(), value);
        access.retain(|k| k != &key);
        access.push(key);
    }

    /// Remove a value
    pub fn remove(&self, key: &K) {
        self.entries.write().remove(key);
        self.access_order.write().retain(|k| k != key);
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.entries.write().clear();
        self.access_order.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let cache = LruCache::new(10);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        cache.remove(&"a");
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);

        // Touch "a" so "b" becomes the eviction candidate.
        cache.get(&"a");
        cache.insert("c", 3);

        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), Some(2));
    }
}
