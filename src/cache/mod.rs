//! Response cache with per-key generation coalescing.
//!
//! Entries live in a sharded in-memory LRU and are written through to an
//! optional durable backend. While a generation for a key is in flight,
//! later requests for the same key subscribe to its result instead of
//! generating again. Shard mutexes are never held across an `.await`.

mod key;
mod lru;
mod store;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::pipeline::{CacheError, PipelineError};

pub use key::{normalize_query, CacheKey};
pub use lru::CacheEntry;
pub use store::{CacheBackend, SqliteCacheBackend};

use lru::LruShard;

type FlightResult = Option<Result<String, PipelineError>>;
type FlightSender = Arc<watch::Sender<FlightResult>>;

struct Shard {
    lru: LruShard,
    in_flight: HashMap<CacheKey, FlightSender>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Served from memory or the durable tier.
    Cache,
    /// Another request generated it while this one waited.
    InFlight,
    /// This request called the generator.
    Generated,
}

#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub answer: String,
    pub source: CacheSource,
    /// Set when the cache misbehaved but the answer was still produced.
    pub cache_warning: Option<CacheError>,
}

enum Role {
    Hit(CacheEntry),
    Follower(watch::Receiver<FlightResult>),
    Leader(FlightSender),
}

/// Removes the in-flight registration when the leader finishes or is
/// dropped. Followers of a dropped leader see the channel close and retry.
struct FlightGuard<'a> {
    shard: &'a Mutex<Shard>,
    key: CacheKey,
    sender: FlightSender,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut shard = self.shard.lock().unwrap_or_else(PoisonError::into_inner);
        if shard
            .in_flight
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.sender))
        {
            shard.in_flight.remove(&self.key);
        }
    }
}

pub struct ResponseCache {
    shards: Vec<Mutex<Shard>>,
    capacity: usize,
    backend: Option<Arc<dyn CacheBackend>>,
}

impl ResponseCache {
    pub fn new(capacity: usize, shards: usize, backend: Option<Arc<dyn CacheBackend>>) -> Self {
        let shards = shards.max(1);
        let capacity = capacity.max(1);
        let per_shard = capacity.div_ceil(shards);
        Self {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(Shard {
                        lru: LruShard::new(per_shard),
                        in_flight: HashMap::new(),
                    })
                })
                .collect(),
            capacity,
            backend,
        }
    }

    fn shard_for(&self, key: &CacheKey) -> &Mutex<Shard> {
        &self.shards[key.shard(self.shards.len())]
    }

    fn lock_shard(&self, key: &CacheKey) -> MutexGuard<'_, Shard> {
        self.shard_for(key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Entries held in memory.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).lru.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).in_flight.len())
            .sum()
    }

    /// Memory first, then the durable tier. A durable hit is promoted into
    /// memory.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let cached = self.lock_shard(key).lru.get(key);
        if let Some(entry) = cached {
            self.touch_durable(key).await;
            return Ok(Some(entry));
        }

        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        let Some(mut entry) = backend.load(key).await? else {
            return Ok(None);
        };

        entry.hit_count += 1;
        let evicted = self.lock_shard(key).lru.put(entry.clone());
        self.forget_durable(evicted).await;
        backend.record_hit(key).await?;
        tracing::debug!(cache_key = %key, "Promoted durable cache entry");
        Ok(Some(entry))
    }

    pub async fn put(&self, key: CacheKey, answer_text: String) -> Result<(), CacheError> {
        let entry = CacheEntry {
            key: key.clone(),
            answer_text,
            created_at: Utc::now().trunc_subsecs(6),
            hit_count: 0,
        };

        let evicted = self.lock_shard(&key).lru.put(entry.clone());
        self.forget_durable(evicted).await;

        if let Some(backend) = &self.backend {
            backend.save(&entry).await?;
            let pruned = backend.prune(self.capacity).await?;
            if pruned > 0 {
                tracing::debug!(pruned, capacity = self.capacity, "Pruned durable cache");
            }
        }
        Ok(())
    }

    /// Returns whether the entry was held in memory.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = self.lock_shard(key).lru.remove(key);
        if let Some(backend) = &self.backend {
            backend.delete(key).await?;
        }
        Ok(removed)
    }

    /// Keeps durable recency in step with memory hits.
    async fn touch_durable(&self, key: &CacheKey) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.record_hit(key).await {
                tracing::warn!(cache_key = %key, error = %e, "Failed to record cache hit");
            }
        }
    }

    async fn forget_durable(&self, evicted: Vec<CacheKey>) {
        let Some(backend) = &self.backend else {
            return;
        };
        for key in evicted {
            tracing::debug!(cache_key = %key, "Evicted cache entry");
            if let Err(e) = backend.delete(&key).await {
                tracing::warn!(cache_key = %key, error = %e, "Failed to delete evicted cache entry");
            }
        }
    }

    /// Returns the cached answer for `key`, or runs `generate` exactly once
    /// across all concurrent callers with the same key.
    ///
    /// Cache failures never fail the call; they come back as
    /// `cache_warning`. A generation error is shared with every waiter.
    pub async fn get_or_generate<F, Fut>(
        &self,
        key: &CacheKey,
        generate: F,
    ) -> Result<CacheOutcome, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, PipelineError>>,
    {
        let mut cache_warning = None;

        let sender = loop {
            match self.get(key).await {
                Ok(Some(entry)) => {
                    return Ok(CacheOutcome {
                        answer: entry.answer_text,
                        source: CacheSource::Cache,
                        cache_warning,
                    })
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(cache_key = %key, error = %e, "Cache lookup failed; generating directly");
                    cache_warning = Some(e);
                }
            }

            let role = {
                let mut shard = self.lock_shard(key);
                if let Some(entry) = shard.lru.get(key) {
                    Role::Hit(entry)
                } else if let Some(sender) = shard.in_flight.get(key) {
                    Role::Follower(sender.subscribe())
                } else {
                    let (sender, _) = watch::channel(None);
                    let sender = Arc::new(sender);
                    shard.in_flight.insert(key.clone(), sender.clone());
                    Role::Leader(sender)
                }
            };

            match role {
                Role::Hit(entry) => {
                    self.touch_durable(key).await;
                    return Ok(CacheOutcome {
                        answer: entry.answer_text,
                        source: CacheSource::Cache,
                        cache_warning,
                    })
                }
                Role::Follower(mut receiver) => {
                    tracing::debug!(cache_key = %key, "Waiting for in-flight generation");
                    let published = match receiver.wait_for(Option::is_some).await {
                        Ok(value) => value.clone(),
                        Err(_) => None,
                    };
                    match published {
                        Some(result) => {
                            return result.map(|answer| CacheOutcome {
                                answer,
                                source: CacheSource::InFlight,
                                cache_warning,
                            })
                        }
                        // Leader went away without an answer; try again.
                        None => continue,
                    }
                }
                Role::Leader(sender) => break sender,
            }
        };

        let _flight = FlightGuard {
            shard: self.shard_for(key),
            key: key.clone(),
            sender: sender.clone(),
        };

        let result = generate().await;
        if let Ok(answer) = &result {
            if let Err(e) = self.put(key.clone(), answer.clone()).await {
                tracing::warn!(cache_key = %key, error = %e, "Failed to store answer in cache");
                cache_warning = Some(e);
            }
        }
        sender.send_replace(Some(result.clone()));

        result.map(|answer| CacheOutcome {
            answer,
            source: CacheSource::Generated,
            cache_warning,
        })
    }
}
