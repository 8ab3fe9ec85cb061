//! Bounded in-memory cache of computed embeddings.

use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Maps text to its embedding, evicting the oldest entry once full.
///
/// Keys are hashed with FNV; lookups still compare the full text, so a hash
/// collision can never return another text's vector.
#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: FnvHashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl EmbeddingCache {
    /// Returns `None` for a zero capacity, which means "no cache".
    pub fn new(capacity: usize) -> Option<Self> {
        (capacity > 0).then(|| Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let inner = self.inner.lock().ok()?;
        inner.entries.get(text).cloned()
    }

    pub fn insert(&self, text: &str, vector: &[f32]) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.entries.contains_key(text) {
            return;
        }
        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        inner.entries.insert(text.to_string(), vector.to_vec());
        inner.order.push_back(text.to_string());
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.order.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_disables_cache() {
        assert!(EmbeddingCache::new(0).is_none());
    }

    #[test]
    fn test_insert_and_get() {
        let cache = EmbeddingCache::new(4).unwrap();
        cache.insert("hello", &[1.0, 2.0]);

        assert_eq!(cache.get("hello"), Some(vec![1.0, 2.0]));
        assert_eq!(cache.get("world"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oldest_entry_is_evicted() {
        let cache = EmbeddingCache::new(2).unwrap();
        cache.insert("a", &[1.0]);
        cache.insert("b", &[2.0]);
        cache.insert("c", &[3.0]);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(vec![2.0]));
        assert_eq!(cache.get("c"), Some(vec![3.0]));

        cache.clear();
        assert!(cache.is_empty());
    }
}
