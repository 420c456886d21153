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

//! The shared, volatile cache capability.
//!
//! A volatile cache is shared by every process but may drop any entry at any time without notice. Nothing stored
//! here is authoritative: callers must tolerate a miss on every read.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use bingo_common::{
    clock::{Clock, SystemClock},
    error::{Error, ErrorKind, Result},
};
use bytes::Bytes;
use futures_core::future::BoxFuture;
use parking_lot::Mutex;

/// Signed offset applied by [`VolatileCache::offset_multi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// Add to the value, wrapping at `2^64`.
    Incr(u64),
    /// Subtract from the value, saturating at `0`.
    Decr(u64),
}

/// Shared cache service: key to bytes with atomic integer offsets.
///
/// Integers are stored as ASCII decimal bytes, as memcache does, so `get` on an integer key returns its digits.
pub trait VolatileCache: Send + Sync + Debug + 'static {
    /// Fetch the live values of the given keys. Missing keys are absent from the result.
    fn get_multi(&self, keys: Vec<String>) -> BoxFuture<'static, Result<HashMap<String, Bytes>>>;

    /// Store the given entries, optionally expiring after `expiry`.
    fn set_multi(&self, entries: Vec<(String, Bytes)>, expiry: Option<Duration>) -> BoxFuture<'static, Result<()>>;

    /// Store the entry only if the key is absent. Returns `true` if the entry was stored.
    fn add(&self, key: String, value: Bytes, expiry: Option<Duration>) -> BoxFuture<'static, Result<bool>>;

    /// Delete the given keys.
    fn delete_multi(&self, keys: Vec<String>) -> BoxFuture<'static, Result<()>>;

    /// Atomically apply offsets to integer values.
    ///
    /// An absent key is created from `initial` before the offset is applied, or skipped if `initial` is `None`.
    /// Returns the new values of the keys that were updated.
    fn offset_multi(
        &self,
        offsets: Vec<(String, Offset)>,
        initial: Option<u64>,
    ) -> BoxFuture<'static, Result<HashMap<String, u64>>>;

    /// Fetch a single value.
    fn get(&self, key: String) -> BoxFuture<'static, Result<Option<Bytes>>> {
        let future = self.get_multi(vec![key.clone()]);
        Box::pin(async move { Ok(future.await?.remove(&key)) })
    }

    /// Store a single entry.
    fn set(&self, key: String, value: Bytes, expiry: Option<Duration>) -> BoxFuture<'static, Result<()>> {
        self.set_multi(vec![(key, value)], expiry)
    }

    /// Delete a single key.
    fn delete(&self, key: String) -> BoxFuture<'static, Result<()>> {
        self.delete_multi(vec![key])
    }

    /// Atomically increment a single integer value, returns the new value.
    fn incr(&self, key: String, delta: u64, initial: Option<u64>) -> BoxFuture<'static, Result<Option<u64>>> {
        let future = self.offset_multi(vec![(key.clone(), Offset::Incr(delta))], initial);
        Box::pin(async move { Ok(future.await?.remove(&key)) })
    }
}

/// Parse an integer stored by [`VolatileCache::offset_multi`].
pub fn parse_integer(key: &str, value: &[u8]) -> Result<u64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "cached value is not an integer").with_context("key", key))
}

#[derive(Debug)]
struct Slot {
    value: Bytes,
    expire_at: Option<u64>,
}

#[derive(Debug, Default)]
struct MemoryVolatileCacheInner {
    slots: HashMap<String, Slot>,
    queue: VecDeque<String>,
}

impl MemoryVolatileCacheInner {
    fn live(&self, key: &str, now: u64) -> Option<&Slot> {
        self.slots
            .get(key)
            .filter(|slot| slot.expire_at.is_none_or(|expire_at| expire_at > now))
    }

    fn store(&mut self, key: String, slot: Slot, capacity: Option<usize>) {
        if self.slots.insert(key.clone(), slot).is_none() {
            self.queue.push_back(key);
        }
        let Some(capacity) = capacity else { return };
        while self.slots.len() > capacity {
            match self.queue.pop_front() {
                Some(key) => {
                    if self.slots.remove(&key).is_some() {
                        tracing::trace!("[memory volatile cache]: evict {key} to fit capacity {capacity}");
                    }
                }
                None => break,
            }
        }
    }
}

/// In-process [`VolatileCache`] with optional FIFO capacity and explicit eviction hooks.
#[derive(Debug, Clone)]
pub struct MemoryVolatileCache {
    inner: Arc<Mutex<MemoryVolatileCacheInner>>,
    capacity: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryVolatileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVolatileCache {
    /// Create an unbounded cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryVolatileCacheInner::default())),
            capacity: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Bound the entry count, the oldest entries are evicted first.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the clock that drives expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Drop a key as if the cache service evicted it.
    pub fn evict(&self, key: &str) -> bool {
        self.inner.lock().slots.remove(key).is_some()
    }

    /// Drop every key as if the cache service restarted.
    pub fn evict_all(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.queue.clear();
    }

    /// Keys currently stored, live or not.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().slots.keys().cloned().collect()
    }

    /// Count of stored entries.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire_at(&self, expiry: Option<Duration>) -> Option<u64> {
        expiry.map(|expiry| self.clock.deadline(expiry))
    }

    fn apply_offsets(&self, offsets: Vec<(String, Offset)>, initial: Option<u64>) -> Result<HashMap<String, u64>> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        let mut res = HashMap::with_capacity(offsets.len());

        for (key, offset) in offsets {
            let (current, expire_at) = match inner.live(&key, now) {
                Some(slot) => (parse_integer(&key, &slot.value)?, slot.expire_at),
                None => match initial {
                    Some(initial) => (initial, None),
                    None => continue,
                },
            };
            let value = match offset {
                Offset::Incr(delta) => current.wrapping_add(delta),
                Offset::Decr(delta) => current.saturating_sub(delta),
            };
            let slot = Slot {
                value: Bytes::from(value.to_string()),
                expire_at,
            };
            inner.store(key.clone(), slot, self.capacity);
            res.insert(key, value);
        }

        Ok(res)
    }
}

impl VolatileCache for MemoryVolatileCache {
    fn get_multi(&self, keys: Vec<String>) -> BoxFuture<'static, Result<HashMap<String, Bytes>>> {
        let now = self.clock.now_millis();
        let inner = self.inner.lock();
        let res = keys
            .into_iter()
            .filter_map(|key| inner.live(&key, now).map(|slot| slot.value.clone()).map(|v| (key, v)))
            .collect();
        Box::pin(async move { Ok(res) })
    }

    fn set_multi(&self, entries: Vec<(String, Bytes)>, expiry: Option<Duration>) -> BoxFuture<'static, Result<()>> {
        let expire_at = self.expire_at(expiry);
        let mut inner = self.inner.lock();
        for (key, value) in entries {
            inner.store(key, Slot { value, expire_at }, self.capacity);
        }
        Box::pin(async move { Ok(()) })
    }

    fn add(&self, key: String, value: Bytes, expiry: Option<Duration>) -> BoxFuture<'static, Result<bool>> {
        let now = self.clock.now_millis();
        let expire_at = self.expire_at(expiry);
        let mut inner = self.inner.lock();
        let added = match inner.live(&key, now) {
            Some(_) => false,
            None => {
                inner.store(key, Slot { value, expire_at }, self.capacity);
                true
            }
        };
        Box::pin(async move { Ok(added) })
    }

    fn delete_multi(&self, keys: Vec<String>) -> BoxFuture<'static, Result<()>> {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.slots.remove(&key);
        }
        Box::pin(async move { Ok(()) })
    }

    fn offset_multi(
        &self,
        offsets: Vec<(String, Offset)>,
        initial: Option<u64>,
    ) -> BoxFuture<'static, Result<HashMap<String, u64>>> {
        let res = self.apply_offsets(offsets, initial);
        Box::pin(async move { res })
    }
}
