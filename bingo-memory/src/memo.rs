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

use std::{borrow::Borrow, fmt::Debug, hash::Hash};

use hashbrown::HashMap;

/// Per-request memo, the first cache tier.
///
/// A memo is owned by exactly one request and dropped with it, so it needs no synchronization and no expiry.
pub struct RequestMemo<K, V> {
    map: HashMap<K, V>,
}

impl<K, V> Debug for RequestMemo<K, V>
where
    K: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMemo").field("keys", &self.map.keys()).finish()
    }
}

impl<K, V> Default for RequestMemo<K, V> {
    fn default() -> Self {
        Self { map: HashMap::default() }
    }
}

impl<K, V> RequestMemo<K, V>
where
    K: Hash + Eq,
{
    /// Create an empty memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a memoized value.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key)
    }

    /// Get a memoized value for update.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get_mut(key)
    }

    /// Memoize a value, returns the previous one.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    /// Forget a value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key)
    }

    /// Drain every memoized value.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        self.map.drain()
    }

    /// Count of memoized values.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_memo() {
        let mut memo: RequestMemo<String, Vec<u32>> = RequestMemo::new();
        assert!(memo.get("catalog").is_none());

        memo.insert("catalog".to_string(), vec![1]);
        memo.get_mut("catalog").unwrap().push(2);
        assert_eq!(memo.get("catalog"), Some(&vec![1, 2]));

        let drained = memo.drain().collect::<Vec<_>>();
        assert_eq!(drained, vec![("catalog".to_string(), vec![1, 2])]);
        assert!(memo.is_empty());
    }
}
