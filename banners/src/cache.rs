//! Bounded in-memory cache with a TTL chosen per entry.
//!
//! Backed by `moka`, so reads and writes from many tasks are safe and a read racing a
//! write for the same key sees either the old or the new value, never a mix. When the
//! cache is full, moka's size-based policy (LRU with TinyLFU admission) frees space.

use std::hash::Hash;
use std::time::{Duration, Instant};

use moka::{sync::Cache, Expiry};

use crate::store::BannerRow;

/// (feature_id, tag_id)
pub type FeatureTagKey = (i64, i64);

/// Cache used by the user-facing lookup.
pub type BannerCache = TtlCache<FeatureTagKey, BannerRow>;

#[derive(Clone)]
struct Entry<V> {
    value: V,
    ttl: Option<Duration>,
}

struct PerEntryExpiry;

impl<K, V> Expiry<K, Entry<V>> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &K,
        entry: &Entry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.ttl
    }

    fn expire_after_update(
        &self,
        _key: &K,
        entry: &Entry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        entry.ttl
    }
}

#[derive(Clone)]
pub struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<K, Entry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryExpiry)
            .build();

        Self { cache }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.cache.get(key).map(|entry| entry.value)
    }

    /// Stores `value` under `key`. A zero `ttl` keeps the entry until it is replaced,
    /// invalidated or evicted for space.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let ttl = (!ttl.is_zero()).then_some(ttl);
        self.cache.insert(key, Entry { value, ttl });
    }

    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Approximate; pending maintenance is applied lazily by moka.
    #[cfg(test)]
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("cache", &"<moka cache>")
            .finish()
    }
}
