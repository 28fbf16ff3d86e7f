//! Time-bounded map used for transaction bookkeeping

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A map whose entries disappear `ttl` after insertion
#[derive(Debug)]
pub struct ExpiringCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash, V> ExpiringCache<K, V> {
    /// Empty cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Insert, purging expired entries first
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.purge_expired();
        self.entries
            .insert(key, (Instant::now() + self.ttl, value))
            .map(|(_, v)| v)
    }

    /// Live value for `key`
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(expires, _)| *expires > Instant::now())
            .map(|(_, v)| v)
    }

    /// Mutable live value for `key`
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let now = Instant::now();
        self.entries
            .get_mut(key)
            .filter(|(expires, _)| *expires > now)
            .map(|(_, v)| v)
    }

    /// Live values
    pub fn values(&self) -> impl Iterator<Item = &V> {
        let now = Instant::now();
        self.entries
            .values()
            .filter(move |(expires, _)| *expires > now)
            .map(|(_, v)| v)
    }

    /// Whether a live value exists for `key`
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key`, expired or not
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Remove every entry, returning the live ones
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let now = Instant::now();
        self.entries
            .drain()
            .filter(|(_, (expires, _))| *expires > now)
            .map(|(k, (_, v))| (k, v))
            .collect()
    }

    /// Drop expired entries
    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, (expires, _)| *expires > now);
    }

    /// Entries, expired ones included until purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
