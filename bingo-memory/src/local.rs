// Copyright 2026 bingo Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-local cache tier.
//!
//! Entries live for a bounded TTL and are never shared across processes. Readers never block writers for longer
//! than a shard lookup, writers replace entries wholesale.

use std::{
    borrow::Borrow,
    collections::VecDeque,
    fmt::Debug,
    hash::{BuildHasher, Hash},
    sync::Arc,
    time::Duration,
};

use bingo_common::clock::{Clock, SystemClock};
use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::RwLock;

struct LocalEntry<V> {
    value: V,
    expire_at: u64,
}

struct LocalCacheShard<K, V> {
    map: HashMap<K, LocalEntry<V>>,
    // Insertion order for FIFO eviction. May hold keys that have been removed since.
    queue: VecDeque<K>,
    capacity: usize,
}

impl<K, V> LocalCacheShard<K, V>
where
    K: Hash + Eq + Clone,
{
    fn insert(&mut self, key: K, value: V, expire_at: u64, now: u64) {
        let entry = LocalEntry { value, expire_at };
        if self.map.insert(key.clone(), entry).is_none() {
            self.queue.push_back(key);
        }
        self.evict(now);
    }

    fn evict(&mut self, now: u64) {
        if self.map.len() <= self.capacity {
            return;
        }

        // Expired entries go first.
        self.map.retain(|_, entry| entry.expire_at > now);

        while self.map.len() > self.capacity {
            match self.queue.pop_front() {
                Some(key) => {
                    self.map.remove(&key);
                }
                None => break,
            }
        }

        if self.queue.len() > self.capacity.saturating_mul(2) {
            let map = &self.map;
            self.queue.retain(|key| map.contains_key(key));
        }
    }
}

struct LocalCacheInner<K, V, S> {
    shards: Vec<RwLock<LocalCacheShard<K, V>>>,
    hash_builder: S,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

/// Process-local key-value cache with per-entry expiry.
pub struct LocalCache<K, V, S = DefaultHashBuilder> {
    inner: Arc<LocalCacheInner<K, V, S>>,
}

impl<K, V, S> Debug for LocalCache<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("shards", &self.inner.shards.len())
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}

impl<K, V, S> Clone for LocalCache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, S> LocalCache<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    /// Get a live entry.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.inner.clock.now_millis();
        let shard = self.inner.shards[self.shard(key)].read();
        shard
            .map
            .get(key)
            .filter(|entry| entry.expire_at > now)
            .map(|entry| entry.value.clone())
    }

    /// Insert an entry that expires after the cache TTL.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.inner.ttl)
    }

    /// Insert an entry that expires after the given TTL.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = self.inner.clock.now_millis();
        let expire_at = now.saturating_add(ttl.as_millis() as u64);
        let index = self.shard(&key);
        self.inner.shards[index].write().insert(key, value, expire_at, now);
    }

    /// Remove an entry, returns the value if it was still live.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.inner.clock.now_millis();
        let mut shard = self.inner.shards[self.shard(key)].write();
        shard
            .map
            .remove(key)
            .filter(|entry| entry.expire_at > now)
            .map(|entry| entry.value)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        for shard in self.inner.shards.iter() {
            let mut shard = shard.write();
            shard.map.clear();
            shard.queue.clear();
        }
    }

    /// Count of entries, including expired entries not reclaimed yet.
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|shard| shard.read().map.len()).sum()
    }

    /// Returns `true` if there is no entry at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Default TTL of the entries.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    fn shard<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        self.inner.hash_builder.hash_one(key) as usize % self.inner.shards.len()
    }
}

/// Builder for [`LocalCache`].
#[derive(Clone)]
pub struct LocalCacheBuilder<S = DefaultHashBuilder> {
    capacity: usize,
    shards: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    hash_builder: S,
}

impl LocalCacheBuilder {
    /// Create a builder for a cache holding up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shards: 8,
            ttl: Duration::from_secs(60),
            clock: Arc::new(SystemClock),
            hash_builder: DefaultHashBuilder::default(),
        }
    }
}

impl<S> LocalCacheBuilder<S>
where
    S: BuildHasher + Send + Sync + 'static,
{
    /// Set the shard count. Operations on different shards never contend.
    ///
    /// Default: 8.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    /// Set the entry TTL.
    ///
    /// Default: 60s.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the clock that drives expiry.
    ///
    /// Default: [`SystemClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the hash builder used to pick shards.
    pub fn with_hash_builder<OS>(self, hash_builder: OS) -> LocalCacheBuilder<OS>
    where
        OS: BuildHasher + Send + Sync + 'static,
    {
        LocalCacheBuilder {
            capacity: self.capacity,
            shards: self.shards,
            ttl: self.ttl,
            clock: self.clock,
            hash_builder,
        }
    }

    /// Build the cache.
    pub fn build<K, V>(self) -> LocalCache<K, V, S>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let shard_capacity = self.capacity.div_ceil(self.shards).max(1);
        let shards = (0..self.shards)
            .map(|_| {
                RwLock::new(LocalCacheShard {
                    map: HashMap::default(),
                    queue: VecDeque::new(),
                    capacity: shard_capacity,
                })
            })
            .collect();
        LocalCache {
            inner: Arc::new(LocalCacheInner {
                shards,
                hash_builder: self.hash_builder,
                ttl: self.ttl,
                clock: self.clock,
            }),
        }
    }
}
