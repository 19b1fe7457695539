//! In-process TTL + LRU cache, registered per name in a process-wide registry.
//!
//! Each named cache is typed (`Cache<T>`); the registry sees caches through
//! the untyped [`CacheHandle`] trait for the admin surface (stats / clear /
//! cleanup across every cache).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters every cache tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub size: usize,
}

struct Entry<T> {
    data: T,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed_at: Instant,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

struct Inner<T> {
    entries: HashMap<String, Entry<T>>,
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
}

/// One named TTL + LRU cache. Cloning shares the underlying store.
#[derive(Clone)]
pub struct Cache<T> {
    name: String,
    max_size: usize,
    default_ttl: Duration,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone + Send + 'static> Cache<T> {
    pub fn new(name: impl Into<String>, max_size: usize, default_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            max_size: max_size.max(1),
            default_ttl,
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                sets: 0,
                deletes: 0,
                evictions: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lookup; expired entries are purged and counted as misses.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let now = Instant::now();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if expired {
            inner.entries.remove(key);
            inner.misses += 1;
            return None;
        }
        inner.hits += 1;
        let entry = inner.entries.get_mut(key).expect("checked above");
        entry.access_count += 1;
        entry.last_accessed_at = now;
        Some(entry.data.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: T) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL; at capacity the entry with the oldest
    /// `last_accessed_at` is evicted first.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_size {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed_at)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&victim);
                inner.evictions += 1;
            }
        }
        inner.entries.insert(
            key,
            Entry {
                data: value,
                created_at: now,
                ttl,
                access_count: 0,
                last_accessed_at: now,
            },
        );
        inner.sets += 1;
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.entries.remove(key).is_some();
        if removed {
            inner.deletes += 1;
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(key)
            .map(|e| !e.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset the remaining TTL of an existing entry.
    pub fn set_ttl(&self, key: &str, ttl: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.created_at = Instant::now();
                entry.ttl = ttl;
                true
            }
            None => false,
        }
    }

    /// Remaining TTL of a live entry.
    pub fn get_ttl(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.entries.get(key).and_then(|e| {
            let elapsed = now.duration_since(e.created_at);
            (elapsed < e.ttl).then(|| e.ttl - elapsed)
        })
    }

    /// Delete every key matching `predicate`. Used for targeted invalidation
    /// (e.g. all `merged-instances` variants after a state write).
    pub fn invalidate_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let victims: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect();
        for victim in &victims {
            inner.entries.remove(victim);
            inner.deletes += 1;
        }
        victims.len()
    }
}

/// Untyped view the registry keeps of every named cache.
pub trait CacheHandle: Send + Sync {
    fn name(&self) -> &str;
    fn stats(&self) -> CacheStats;
    fn clear(&self);
    fn cleanup_expired(&self) -> usize;
}

impl<T: Clone + Send + 'static> CacheHandle for Cache<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            sets: inner.sets,
            deletes: inner.deletes,
            evictions: inner.evictions,
            size: inner.entries.len(),
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.entries.len() as u64;
        inner.entries.clear();
        inner.deletes += n;
    }

    fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let victims: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for victim in &victims {
            inner.entries.remove(victim);
        }
        victims.len()
    }
}

/// Process-wide registry of named caches, owned by the composition root.
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<Vec<Arc<dyn CacheHandle>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a typed cache in one step.
    pub fn create<T: Clone + Send + 'static>(
        &self,
        name: &str,
        max_size: usize,
        default_ttl: Duration,
    ) -> Cache<T> {
        let cache = Cache::new(name, max_size, default_ttl);
        self.caches
            .write()
            .unwrap()
            .push(Arc::new(cache.clone()) as Arc<dyn CacheHandle>);
        cache
    }

    pub fn stats(&self) -> HashMap<String, CacheStats> {
        self.caches
            .read()
            .unwrap()
            .iter()
            .map(|c| (c.name().to_string(), c.stats()))
            .collect()
    }

    pub fn clear_all(&self) {
        for cache in self.caches.read().unwrap().iter() {
            cache.clear();
        }
    }

    /// Sweep expired entries from every cache; returns total removed.
    pub fn cleanup_all(&self) -> usize {
        self.caches
            .read()
            .unwrap()
            .iter()
            .map(|c| c.cleanup_expired())
            .sum()
    }
}
