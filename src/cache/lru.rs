use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::key::CacheKey;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub answer_text: String,
    pub created_at: DateTime<Utc>,
    pub hit_count: u64,
}

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

/// Bounded LRU map. Recency is a monotonically increasing tick; the
/// smallest tick is the eviction victim.
pub(crate) struct LruShard {
    capacity: usize,
    clock: u64,
    slots: HashMap<CacheKey, Slot>,
    recency: BTreeMap<u64, CacheKey>,
}

impl LruShard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            slots: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns a copy and marks the entry most recently used.
    pub fn get(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let tick = self.next_tick();
        let slot = self.slots.get_mut(key)?;
        self.recency.remove(&slot.tick);
        slot.tick = tick;
        slot.entry.hit_count += 1;
        self.recency.insert(tick, key.clone());
        Some(slot.entry.clone())
    }

    /// Inserts or replaces an entry. Returns the keys evicted to make room.
    pub fn put(&mut self, entry: CacheEntry) -> Vec<CacheKey> {
        let tick = self.next_tick();
        let key = entry.key.clone();

        if let Some(previous) = self.slots.insert(key.clone(), Slot { entry, tick }) {
            self.recency.remove(&previous.tick);
        }
        self.recency.insert(tick, key);

        let mut evicted = Vec::new();
        while self.slots.len() > self.capacity {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            self.slots.remove(&victim);
            evicted.push(victim);
        }
        evicted
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.recency.remove(&slot.tick);
                true
            }
            None => false,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
