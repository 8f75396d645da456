//! Frame-aged object cache.
//!
//! # Overview
//!
//! [`ObjectCache`] deduplicates backend objects that are expensive to create
//! (render passes, graphics pipelines) by their structural description. Each
//! entry carries an idle counter: [`find`](ObjectCache::find) resets it,
//! [`new_frame`](ObjectCache::new_frame) advances it, and an entry whose
//! counter passes the configured maximum is handed to the deleter and
//! dropped. There is no explicit invalidation; eviction is purely time based
//! and only happens between frames.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use forge_rhi::cache::ObjectCache;
//!
//! let destroyed = Arc::new(Mutex::new(Vec::new()));
//! let sink = destroyed.clone();
//! let mut cache = ObjectCache::new(2, move |value: u32| sink.lock().unwrap().push(value));
//!
//! cache.insert("opaque", 7);
//! assert_eq!(cache.find(&"opaque"), Some(7));
//!
//! for _ in 0..3 {
//!     cache.new_frame();
//! }
//! assert!(cache.is_empty());
//! assert_eq!(*destroyed.lock().unwrap(), vec![7]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Default number of idle frames an entry survives.
pub const DEFAULT_MAX_IDLE_FRAMES: u32 = 8;

struct Entry<V> {
    value: V,
    idle_frames: u32,
}

/// Map from description to backend object with idle-frame eviction.
pub struct ObjectCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    max_idle_frames: u32,
    deleter: Box<dyn FnMut(V) + Send>,
}

impl<K, V> ObjectCache<K, V>
where
    K: Hash + Eq,
    V: Copy,
{
    /// Creates a cache whose entries are evicted after `max_idle_frames`
    /// frames without a lookup. `deleter` releases evicted values.
    pub fn new(max_idle_frames: u32, deleter: impl FnMut(V) + Send + 'static) -> Self {
        Self {
            entries: HashMap::new(),
            max_idle_frames,
            deleter: Box::new(deleter),
        }
    }

    /// Inserts `value` under `key` with a fresh idle counter.
    ///
    /// A value already cached under an equal key is released first.
    pub fn insert(&mut self, key: K, value: V) {
        let previous = self.entries.insert(
            key,
            Entry {
                value,
                idle_frames: 0,
            },
        );
        if let Some(previous) = previous {
            (self.deleter)(previous.value);
        }
    }

    /// Looks up `key`, resetting its idle counter on a hit.
    pub fn find(&mut self, key: &K) -> Option<V> {
        self.entries.get_mut(key).map(|entry| {
            entry.idle_frames = 0;
            entry.value
        })
    }

    /// Looks up `key`, creating and caching the value on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the error of `create`; nothing is cached in that case.
    pub fn find_or_insert_with<E>(
        &mut self,
        key: &K,
        create: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E>
    where
        K: Clone,
    {
        if let Some(value) = self.find(key) {
            return Ok(value);
        }
        let value = create()?;
        self.insert(key.clone(), value);
        Ok(value)
    }

    /// Advances every entry by one idle frame and evicts the ones that have
    /// been idle for more than the maximum. Returns the number evicted.
    pub fn new_frame(&mut self) -> usize {
        let max_idle = self.max_idle_frames;
        let deleter = &mut self.deleter;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.idle_frames += 1;
            if entry.idle_frames > max_idle {
                deleter(entry.value);
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }

    /// Releases every entry whose key matches `pred`, regardless of its idle
    /// counter. Returns the number evicted.
    ///
    /// Used when an object a key refers to by handle is released, so a later
    /// object reusing that handle cannot hit a stale entry.
    pub fn evict_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let deleter = &mut self.deleter;
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            if pred(key) {
                deleter(entry.value);
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }

    /// Releases every entry.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            (self.deleter)(entry.value);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn max_idle_frames(&self) -> u32 {
        self.max_idle_frames
    }

    /// Whether `key` is cached, without touching its idle counter.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }
}

impl<K, V> fmt::Debug for ObjectCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("len", &self.entries.len())
            .field("max_idle_frames", &self.max_idle_frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn tracked(max_idle: u32) -> (ObjectCache<String, u64>, Arc<Mutex<Vec<u64>>>) {
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let sink = destroyed.clone();
        let cache = ObjectCache::new(max_idle, move |v| sink.lock().unwrap().push(v));
        (cache, destroyed)
    }

    #[test]
    fn test_find_hits_equal_keys() {
        let (mut cache, _) = tracked(DEFAULT_MAX_IDLE_FRAMES);
        cache.insert("pass".to_string(), 11);
        // Distinct but equal key object.
        let key = String::from("pa") + "ss";
        assert_eq!(cache.find(&key), Some(11));
        assert_eq!(cache.find(&"other".to_string()), None);
    }

    #[test]
    fn test_eviction_on_ninth_idle_frame() {
        let (mut cache, destroyed) = tracked(DEFAULT_MAX_IDLE_FRAMES);
        cache.insert("pipeline".to_string(), 5);

        for _ in 0..8 {
            assert_eq!(cache.new_frame(), 0);
        }
        assert!(cache.contains(&"pipeline".to_string()));
        assert!(destroyed.lock().unwrap().is_empty());

        assert_eq!(cache.new_frame(), 1);
        assert!(cache.is_empty());
        assert_eq!(*destroyed.lock().unwrap(), vec![5]);
    }

    #[test]
    fn test_find_resets_idle_counter() {
        let (mut cache, destroyed) = tracked(DEFAULT_MAX_IDLE_FRAMES);
        let key = "pass".to_string();
        cache.insert(key.clone(), 1);

        for _ in 0..8 {
            cache.new_frame();
        }
        assert_eq!(cache.find(&key), Some(1));
        for _ in 0..8 {
            cache.new_frame();
        }
        assert_eq!(cache.len(), 1);
        cache.new_frame();
        assert!(cache.is_empty());
        assert_eq!(*destroyed.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_find_or_insert_with_creates_once() {
        let (mut cache, _) = tracked(DEFAULT_MAX_IDLE_FRAMES);
        let key = "pipeline".to_string();
        let mut created = 0;

        for _ in 0..3 {
            let value = cache
                .find_or_insert_with(&key, || {
                    created += 1;
                    Ok::<_, ()>(99)
                })
                .unwrap();
            assert_eq!(value, 99);
        }
        assert_eq!(created, 1);
    }

    #[test]
    fn test_find_or_insert_with_failure_caches_nothing() {
        let (mut cache, _) = tracked(DEFAULT_MAX_IDLE_FRAMES);
        let result = cache.find_or_insert_with(&"bad".to_string(), || Err("boom"));
        assert_eq!(result, Err("boom"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replacing_entry_releases_previous_value() {
        let (mut cache, destroyed) = tracked(DEFAULT_MAX_IDLE_FRAMES);
        cache.insert("k".to_string(), 1);
        cache.insert("k".to_string(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(*destroyed.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_evict_where_only_touches_matches() {
        let (mut cache, destroyed) = tracked(DEFAULT_MAX_IDLE_FRAMES);
        cache.insert("shader-1".to_string(), 1);
        cache.insert("shader-2".to_string(), 2);
        assert_eq!(cache.evict_where(|key| key.ends_with('1')), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(*destroyed.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_clear_releases_everything() {
        let (mut cache, destroyed) = tracked(DEFAULT_MAX_IDLE_FRAMES);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        cache.clear();
        assert!(cache.is_empty());
        let mut released = destroyed.lock().unwrap().clone();
        released.sort_unstable();
        assert_eq!(released, vec![1, 2]);
    }

    #[test]
    fn test_cache_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ObjectCache<String, u64>>();
    }
}
