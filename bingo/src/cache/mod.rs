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

//! Layered caches over the volatile cache and the durable store.
//!
//! Lookups go request memo, process-local cache, shared snapshot in the volatile cache, then a loader over the
//! durable store. Loaded values populate every tier on the way back.

pub mod catalog;
pub mod identity;

use crate::cache::catalog::CatalogScope;

/// Key layout of one bingo instance in the volatile cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Key space under the given instance name.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Instance name.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Shared catalog snapshot.
    pub fn catalog(&self, scope: CatalogScope) -> String {
        match scope {
            CatalogScope::Live => format!("{}:catalog:live", self.prefix),
            CatalogScope::Archived => format!("{}:catalog:archived", self.prefix),
        }
    }

    /// Participant counter combination of an experiment.
    pub fn participants(&self, experiment: &str) -> String {
        format!("{}:counter:{experiment}:participants", self.prefix)
    }

    /// Conversion counter combination of an experiment.
    pub fn conversions(&self, experiment: &str) -> String {
        format!("{}:counter:{experiment}:conversions", self.prefix)
    }

    /// Creation lock of an experiment family.
    pub fn creation_lock(&self, canonical: &str) -> String {
        format!("{}:create:{canonical}", self.prefix)
    }

    /// Shared snapshot of an identity history.
    pub fn identity(&self, identity: &str) -> String {
        format!("{}:identity:{identity}", self.prefix)
    }

    /// Count of slots ever appended to an identity bucket.
    pub fn bucket_tail(&self, bucket: usize) -> String {
        format!("{}:identity_bucket:{bucket}:tail", self.prefix)
    }

    /// Count of slots of an identity bucket already flushed.
    pub fn bucket_head(&self, bucket: usize) -> String {
        format!("{}:identity_bucket:{bucket}:head", self.prefix)
    }

    /// One slot of an identity bucket.
    pub fn bucket_slot(&self, bucket: usize, slot: u64) -> String {
        format!("{}:identity_bucket:{bucket}:{slot}", self.prefix)
    }

    /// Flush lock of an identity bucket.
    pub fn bucket_lock(&self, bucket: usize) -> String {
        format!("{}:identity_bucket:{bucket}:lock", self.prefix)
    }

    /// Task id of the reconciliation loop.
    pub fn reconcile_task(&self) -> String {
        format!("{}:reconcile", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_space() {
        let keys = KeySpace::new("bingo");
        assert_eq!(keys.participants("gorillas"), "bingo:counter:gorillas:participants");
        assert_eq!(keys.conversions("gorillas"), "bingo:counter:gorillas:conversions");
        assert_eq!(keys.bucket_slot(3, 17), "bingo:identity_bucket:3:17");
        assert_ne!(keys.catalog(CatalogScope::Live), keys.catalog(CatalogScope::Archived));
        assert_ne!(
            KeySpace::new("a").reconcile_task(),
            KeySpace::new("b").reconcile_task()
        );
    }
}
