//! TTL-bounded cache of reference embeddings, keyed by identity.
//!
//! Backed by a sharded map: operations on different identities do not
//! contend, and writes to the same identity are serialized by the shard lock
//! (last write wins). No lock is ever held across frame analysis.
//!
//! Each identity also carries a generation counter that [`EmbeddingCache::invalidate`]
//! bumps. A read-through fill captures the generation before going to the
//! store and only lands if no invalidation happened in between, so a slow
//! store read can never resurrect a reference that was replaced upstream.

use crate::types::Embedding;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Default entry lifetime: 30 minutes.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    embedding: Embedding,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) > ttl
    }
}

#[derive(Debug)]
pub struct EmbeddingCache {
    entries: DashMap<String, CacheEntry>,
    generations: DashMap<String, u64>,
    ttl: Duration,
}

impl EmbeddingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached reference for `identity`, or `None` if absent or older than the TTL.
    pub fn get(&self, identity: &str) -> Option<Embedding> {
        self.get_at(identity, Instant::now())
    }

    pub(crate) fn get_at(&self, identity: &str, now: Instant) -> Option<Embedding> {
        let expired = match self.entries.get(identity) {
            Some(entry) if !entry.is_expired(now, self.ttl) => {
                return Some(entry.embedding.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            // Re-check under the write lock: a concurrent put may have refreshed it.
            self.entries
                .remove_if(identity, |_, entry| entry.is_expired(now, self.ttl));
            tracing::debug!(identity, "embedding cache entry expired");
        }
        None
    }

    /// Insert or overwrite the reference for `identity`.
    pub fn put(&self, identity: &str, embedding: Embedding) {
        self.entries.insert(
            identity.to_string(),
            CacheEntry {
                embedding,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Current generation of `identity`. Capture it before a store read and
    /// hand it to [`EmbeddingCache::put_if_generation`].
    pub fn generation(&self, identity: &str) -> u64 {
        self.generations.get(identity).map_or(0, |g| *g)
    }

    /// Insert only if `identity` has not been invalidated since `generation`
    /// was read. Returns whether the entry was written.
    pub fn put_if_generation(&self, identity: &str, generation: u64, embedding: Embedding) -> bool {
        // Lock order: generations, then entries. `invalidate` takes the same order.
        let current = self.generations.entry(identity.to_string()).or_insert(0);
        if *current != generation {
            tracing::debug!(identity, "stale reference not cached after invalidation");
            return false;
        }
        self.put(identity, embedding);
        true
    }

    /// Drop the entry for `identity`. Called when its reference embedding changes upstream.
    ///
    /// Also bumps the identity's generation, so fills started before this
    /// call are discarded.
    pub fn invalidate(&self, identity: &str) -> bool {
        let mut generation = self.generations.entry(identity.to_string()).or_insert(0);
        *generation += 1;
        let removed = self.entries.remove(identity).is_some();
        drop(generation);
        if removed {
            tracing::debug!(identity, "embedding cache entry invalidated");
        }
        removed
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, self.ttl));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
