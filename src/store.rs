//! Local key/value storage.
//!
//! Entries are grouped by key and keyed by creator inside each group, so one
//! creator overwrites its own record while different creators coexist. Keys
//! are kept in an LRU cache bounded by [`LOCAL_STORE_MAX_KEYS`]; every entry
//! expires on its own after its (clamped) ttl.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::{now_ms, DataEntry, Key, NodeId};

/// Maximum number of distinct keys held locally.
pub const LOCAL_STORE_MAX_KEYS: usize = 100_000;

#[derive(Clone, Debug)]
struct StoredEntry {
    entry: DataEntry,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct LocalDataStore {
    cache: Mutex<LruCache<Key, HashMap<NodeId, StoredEntry>>>,
    max_ttl: Duration,
}

impl LocalDataStore {
    pub fn new(max_ttl: Duration) -> Self {
        Self::with_capacity(max_ttl, LOCAL_STORE_MAX_KEYS)
    }

    pub fn with_capacity(max_ttl: Duration, max_keys: usize) -> Self {
        let cap = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
            max_ttl,
        }
    }

    /// Upsert an entry by (key, creator).
    ///
    /// The ttl is clamped to the store's maximum. A copy with an older
    /// `created_at_ms` than the one held never replaces it, and an equally old
    /// copy never resurrects a tombstone. Returns whether the entry was
    /// written.
    pub fn store_entry(&self, mut entry: DataEntry) -> bool {
        let now = Instant::now();
        let ttl_ms = entry.ttl_ms.min(self.max_ttl.as_millis() as u64);
        entry.ttl_ms = ttl_ms;
        entry.stored_at_ms = now_ms();
        entry.storers.clear();

        let mut cache = self.cache.lock();
        let creators = cache.get_or_insert_mut(entry.key, HashMap::new);
        if let Some(existing) = creators.get(&entry.creator) {
            if !existing.is_expired(now) {
                let held = &existing.entry;
                if held.created_at_ms > entry.created_at_ms
                    || (held.created_at_ms == entry.created_at_ms && held.deleted && !entry.deleted)
                {
                    return false;
                }
            }
        }
        creators.insert(
            entry.creator,
            StoredEntry {
                expires_at: now + Duration::from_millis(ttl_ms),
                entry,
            },
        );
        true
    }

    /// Live entries for `key`, tombstones included.
    pub fn get_entries(&self, key: &Key) -> Vec<DataEntry> {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        cache
            .get(key)
            .map(|creators| {
                creators
                    .values()
                    .filter(|stored| !stored.is_expired(now))
                    .map(|stored| stored.entry.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_entries(&self, key: &Key) -> bool {
        !self.get_entries(key).is_empty()
    }

    /// Tombstone the entry `creator` wrote under `key`.
    pub fn mark_as_deleted(&self, key: &Key, creator: &NodeId) -> bool {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        match cache
            .get_mut(key)
            .and_then(|creators| creators.get_mut(creator))
        {
            Some(stored) if !stored.is_expired(now) => {
                stored.entry.deleted = true;
                true
            }
            _ => false,
        }
    }

    pub fn set_stale(&self, key: &Key, creator: &NodeId, stale: bool) {
        if let Some(stored) = self
            .cache
            .lock()
            .get_mut(key)
            .and_then(|creators| creators.get_mut(creator))
        {
            stored.entry.stale = stale;
        }
    }

    pub fn set_all_entries_stale(&self, key: &Key) {
        if let Some(creators) = self.cache.lock().get_mut(key) {
            for stored in creators.values_mut() {
                stored.entry.stale = true;
            }
        }
    }

    pub fn delete_entry(&self, key: &Key, creator: &NodeId) {
        let mut cache = self.cache.lock();
        let now_empty = match cache.get_mut(key) {
            Some(creators) => {
                creators.remove(creator);
                creators.is_empty()
            }
            None => false,
        };
        if now_empty {
            cache.pop(key);
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        let mut removed = 0;
        let mut empty_keys = Vec::new();
        for (key, creators) in cache.iter_mut() {
            let before = creators.len();
            creators.retain(|_, stored| !stored.is_expired(now));
            removed += before - creators.len();
            if creators.is_empty() {
                empty_keys.push(*key);
            }
        }
        for key in empty_keys {
            cache.pop(&key);
        }
        removed
    }

    /// Every live entry.
    pub fn all_entries(&self) -> Vec<DataEntry> {
        let now = Instant::now();
        self.cache
            .lock()
            .iter()
            .flat_map(|(_, creators)| creators.values())
            .filter(|stored| !stored.is_expired(now))
            .map(|stored| stored.entry.clone())
            .collect()
    }

    /// Number of live entries across all keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.cache
            .lock()
            .iter()
            .map(|(_, creators)| creators.values().filter(|s| !s.is_expired(now)).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
