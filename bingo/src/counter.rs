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

//! Several counters packed into one atomically incremented integer of the volatile cache.
//!
//! A combination of `N` counters occupies one `u64` slot, counter `i` in bits `[i * 64 / N, (i + 1) * 64 / N)`.
//! Increments are plain atomic adds of the shifted delta; draining reads the slot and subtracts exactly what was
//! read, so both stay commutative without compare-and-swap.
//!
//! A field that rolls over into its neighbor, or a drain that observes a concurrent increment large enough to look
//! like garbage, resets the whole combination instead of silently corrupting the neighbor fields.

use std::sync::Arc;

use bingo_common::error::{Error, Result};
use bingo_memory::{parse_integer, Offset, VolatileCache};
use bytes::Bytes;
use itertools::Itertools;

/// `N` counters sharing one slot of the volatile cache.
#[derive(Debug, Clone)]
pub struct PackedCounterSet<const N: usize> {
    cache: Arc<dyn VolatileCache>,
}

impl<const N: usize> PackedCounterSet<N> {
    const LAYOUT: () = assert!(N >= 1 && N <= 64 && 64 % N == 0, "counters must evenly divide 64 bits");

    /// Bits per counter.
    pub const FIELD_BITS: u32 = (64 / N) as u32;
    /// Max value a counter holds before it rolls over.
    pub const FIELD_MAX: u64 = u64::MAX >> (64 - Self::FIELD_BITS);
    /// Counters above this value are close to rolling over.
    pub const WARN_THRESHOLD: u64 = Self::FIELD_MAX / 2;

    /// Create a counter set over the volatile cache.
    pub fn new(cache: Arc<dyn VolatileCache>) -> Self {
        let () = Self::LAYOUT;
        Self { cache }
    }

    fn shift(index: usize) -> u32 {
        index as u32 * Self::FIELD_BITS
    }

    fn field(value: u64, index: usize) -> u64 {
        (value >> Self::shift(index)) & Self::FIELD_MAX
    }

    /// Split a raw combination value into its counters.
    pub fn decompose(value: u64) -> [u64; N] {
        std::array::from_fn(|index| Self::field(value, index))
    }

    fn check_index(key: &str, index: usize) -> Result<()> {
        if index >= N {
            return Err(Error::invalid_argument("counter index out of range")
                .with_context("key", key)
                .with_context("index", index)
                .with_context("counters", N));
        }
        Ok(())
    }

    fn decode(key: &str, value: &Bytes) -> Option<u64> {
        match parse_integer(key, value) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("[packed counter]: drop unreadable combination {key}, error: {e}");
                None
            }
        }
    }

    /// Atomically add `delta` to counter `index` of the combination at `key`, creating it at zero if absent.
    ///
    /// A delta larger than [`Self::FIELD_MAX`] or an index out of range is rejected.
    pub async fn increment(&self, key: &str, index: usize, delta: u64) -> Result<()> {
        Self::check_index(key, index)?;
        if delta > Self::FIELD_MAX {
            return Err(Error::invalid_argument("counter delta exceeds the field capacity")
                .with_context("key", key)
                .with_context("delta", delta)
                .with_context("max", Self::FIELD_MAX));
        }
        if delta == 0 {
            return Ok(());
        }

        let Some(value) = self.cache.incr(key.to_string(), delta << Self::shift(index), Some(0)).await? else {
            return Ok(());
        };

        let field = Self::field(value, index);
        if field < delta {
            tracing::error!(
                "[packed counter]: counter {index} of {key} rolled over past {max}, reset the combination",
                max = Self::FIELD_MAX
            );
            self.cache.delete(key.to_string()).await?;
        } else if field > Self::WARN_THRESHOLD && field - delta <= Self::WARN_THRESHOLD {
            tracing::warn!(
                "[packed counter]: counter {index} of {key} crossed half of its capacity {max}, value: {field}",
                max = Self::FIELD_MAX
            );
        }
        Ok(())
    }

    /// Read counter `index` of the combination at `key`, zero if absent.
    pub async fn read(&self, key: &str, index: usize) -> Result<u64> {
        Self::check_index(key, index)?;
        Ok(self.read_all(key).await?[index])
    }

    /// Read every counter of the combination at `key`.
    pub async fn read_all(&self, key: &str) -> Result<[u64; N]> {
        let value = self.cache.get(key.to_string()).await?;
        let value = value.and_then(|value| Self::decode(key, &value)).unwrap_or_default();
        Ok(Self::decompose(value))
    }

    /// Read and reset the combinations at `keys`.
    ///
    /// Returns the counters as read, in the order of `keys`; absent combinations read as zero. The reset subtracts
    /// exactly what was read, so increments landing in between survive for the next drain.
    pub async fn pop_all(&self, keys: Vec<String>) -> Result<Vec<[u64; N]>> {
        let mut values = self.cache.get_multi(keys.clone()).await?;
        let mut unreadable = vec![];

        let read = keys
            .iter()
            .map(|key| match values.remove(key) {
                Some(value) => match Self::decode(key, &value) {
                    Some(value) => value,
                    None => {
                        unreadable.push(key.clone());
                        0
                    }
                },
                None => 0,
            })
            .collect_vec();

        let offsets = keys
            .iter()
            .zip(read.iter())
            .filter(|(_, value)| **value > 0)
            .map(|(key, value)| (key.clone(), Offset::Decr(*value)))
            .collect_vec();
        let remains = if offsets.is_empty() {
            Default::default()
        } else {
            self.cache.offset_multi(offsets, None).await?
        };

        let mut raced = remains
            .into_iter()
            .filter(|(_, value)| Self::decompose(*value).iter().any(|field| *field > Self::WARN_THRESHOLD))
            .map(|(key, _)| key)
            .collect_vec();
        for key in raced.iter() {
            tracing::error!(
                "[packed counter]: implausible remainder after draining {key}, a concurrent drain or increment raced, reset the combination"
            );
        }
        raced.append(&mut unreadable);
        if !raced.is_empty() {
            self.cache.delete_multi(raced).await?;
        }

        Ok(read.into_iter().map(Self::decompose).collect())
    }

    /// Drop the combinations at `keys`.
    pub async fn delete(&self, keys: Vec<String>) -> Result<()> {
        self.cache.delete_multi(keys).await
    }
}
