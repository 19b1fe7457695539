//! In-process `KvBackend` — tests and embedded runs.
//!
//! Single `tokio::sync::Mutex` over the whole store: every operation is
//! atomic with respect to every other, which is exactly the property the
//! queue leans on. Expiry is checked lazily on access.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::ports::{KvBackend, Result};

#[derive(Default)]
struct Store {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl Store {
    fn purge_expired(&mut self, key: &str) {
        if let Some(entry) = self.strings.get(key) {
            if let Some(at) = entry.expires_at {
                if Instant::now() >= at {
                    self.strings.remove(key);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    store: Mutex<Store>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Glob match supporting `*` only — the shapes the store actually uses
/// (`prefix:*`, `*`, exact keys).
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == key,
        Some((prefix, rest)) => {
            let Some(tail) = key.strip_prefix(prefix) else {
                return false;
            };
            tail.char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(tail.len()))
                .any(|i| glob_match(rest, &tail[i..]))
        }
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut store = self.store.lock().await;
        store.purge_expired(key);
        Ok(store.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut store = self.store.lock().await;
        store.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut store = self.store.lock().await;
        store.purge_expired(key);
        if store.strings.contains_key(key) {
            return Ok(false);
        }
        store.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        let removed = store.strings.remove(key).is_some()
            | store.hashes.remove(key).is_some()
            | store.lists.remove(key).is_some()
            | store.zsets.remove(key).is_some();
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        store.purge_expired(key);
        Ok(store.strings.contains_key(key)
            || store.hashes.contains_key(key)
            || store.lists.contains_key(key)
            || store.zsets.contains_key(key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let store = self.store.lock().await;
        Ok(store.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        store
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        Ok(store
            .hashes
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let store = self.store.lock().await;
        Ok(store.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut store = self.store.lock().await;
        let list = store.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut store = self.store.lock().await;
        Ok(store.lists.get_mut(key).and_then(|l| l.pop_back()))
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let store = self.store.lock().await;
        Ok(store.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        store
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        Ok(store
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let store = self.store.lock().await;
        let mut members: Vec<(&String, &f64)> = store
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap().then_with(|| a.0.cmp(b.0)));
        let take = limit.unwrap_or(usize::MAX);
        Ok(members
            .into_iter()
            .take(take)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut store = self.store.lock().await;
        let Some(zset) = store.zsets.get_mut(key) else {
            return Ok(0);
        };
        let victims: Vec<String> = zset
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(m, _)| m.clone())
            .collect();
        for victim in &victims {
            zset.remove(victim);
        }
        Ok(victims.len() as u64)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let store = self.store.lock().await;
        let mut members: Vec<(&String, &f64)> = store
            .zsets
            .get(key)
            .map(|z| z.iter().collect())
            .unwrap_or_default();
        members.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap().then_with(|| a.0.cmp(b.0)));
        let len = members.len() as isize;
        let norm = |i: isize| -> usize {
            if i < 0 {
                (len + i).max(0) as usize
            } else {
                i.min(len) as usize
            }
        };
        let (start, stop) = (norm(start), norm(stop));
        if start > stop || start >= members.len() {
            return Ok(Vec::new());
        }
        Ok(members[start..=stop.min(members.len() - 1)]
            .iter()
            .map(|(m, _)| (*m).clone())
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let store = self.store.lock().await;
        Ok(store.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let store = self.store.lock().await;
        Ok(store.zsets.get(key).and_then(|z| z.get(member).copied()))
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut store = self.store.lock().await;
        let Some(zset) = store.zsets.get_mut(key) else {
            return Ok(None);
        };
        let winner = zset
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap().then_with(|| a.0.cmp(b.0)))
            .map(|(m, s)| (m.clone(), *s));
        if let Some((member, score)) = winner {
            zset.remove(&member);
            return Ok(Some((member, score)));
        }
        Ok(None)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let store = self.store.lock().await;
        let mut out: Vec<String> = store
            .strings
            .keys()
            .chain(store.hashes.keys())
            .chain(store.lists.keys())
            .chain(store.zsets.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let store = self.store.lock().await;
        Ok(store.strings.get(key).and_then(|e| {
            e.expires_at
                .map(|at| at.saturating_duration_since(Instant::now()))
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut store = self.store.lock().await;
        match store.strings.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
