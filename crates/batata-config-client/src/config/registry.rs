//! Copy-on-write registry of watched configs
//!
//! Readers load the current map without locking. Writers serialize on a
//! mutex, clone the map, apply their change and publish the new map, so a
//! reader always sees either the old or the new map as a whole.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use super::cache::{CacheData, ConfigKey};

type CacheMap = HashMap<ConfigKey, Arc<CacheData>>;

/// Registry of every watched config, keyed by identity
pub struct WatchRegistry {
    entries: ArcSwap<CacheMap>,
    write_lock: Mutex<()>,
    per_task_size: usize,
}

impl WatchRegistry {
    pub fn new(per_task_size: usize) -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            per_task_size: per_task_size.max(1),
        }
    }

    pub fn per_task_size(&self) -> usize {
        self.per_task_size
    }

    pub fn get(&self, key: &ConfigKey) -> Option<Arc<CacheData>> {
        self.entries.load().get(key).cloned()
    }

    /// Insert `candidate` unless an entry for its key already exists.
    ///
    /// A new entry is assigned to shard `size / per_task_size`, where `size` is
    /// the registry size before insertion. If another entry won the race it is
    /// returned with its initializing flag forced back on, so the caller's
    /// listener receives the current value on the next poll.
    pub fn insert_if_absent(&self, candidate: CacheData) -> Arc<CacheData> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load_full();

        if let Some(existing) = current.get(candidate.key()) {
            existing.set_initializing(true);
            return existing.clone();
        }

        let task_id = current.len() / self.per_task_size;
        candidate.set_task_id(task_id);
        let entry = Arc::new(candidate);

        let mut next = CacheMap::clone(&current);
        next.insert(entry.key().clone(), entry.clone());
        self.entries.store(Arc::new(next));

        debug!(key = %entry.key(), task_id, "Registered config watch");
        entry
    }

    pub fn remove(&self, key: &ConfigKey) -> Option<Arc<CacheData>> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load_full();
        if !current.contains_key(key) {
            return None;
        }

        let mut next = CacheMap::clone(&current);
        let removed = next.remove(key);
        self.entries.store(Arc::new(next));
        debug!(key = %key, "Removed config watch");
        removed
    }

    /// Current map; later mutations are not visible through it.
    pub fn snapshot(&self) -> Arc<CacheMap> {
        self.entries.load_full()
    }

    /// Entries owned by shard `task_id`
    pub fn entries_for_task(&self, task_id: usize) -> Vec<Arc<CacheData>> {
        self.entries
            .load()
            .values()
            .filter(|cache| cache.task_id() == task_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of shards needed to cover the registry
    pub fn required_task_count(&self) -> usize {
        self.len().div_ceil(self.per_task_size)
    }
}
