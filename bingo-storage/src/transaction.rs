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

use std::{collections::BTreeMap, sync::Arc};

use bingo_common::error::Result;

use crate::{
    record::{Record, RecordKey},
    store::{Commit, DurableStore, Mutation},
};

/// Optimistic read-modify-write transaction over a [`DurableStore`].
///
/// Every record read through the transaction is validated at commit time; buffered writes are visible to later
/// reads of the same transaction.
#[derive(Debug)]
#[must_use = "a transaction does nothing unless committed"]
pub struct Transaction {
    store: Arc<dyn DurableStore>,
    reads: BTreeMap<RecordKey, Option<u64>>,
    mutations: BTreeMap<RecordKey, Mutation>,
}

impl Transaction {
    /// Begin a transaction.
    pub fn begin(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            reads: BTreeMap::new(),
            mutations: BTreeMap::new(),
        }
    }

    /// Read a record.
    pub async fn get(&mut self, key: RecordKey) -> Result<Option<Record>> {
        Ok(self.get_multi(vec![key]).await?.pop().flatten())
    }

    /// Read records, in the order of the given keys.
    pub async fn get_multi(&mut self, keys: Vec<RecordKey>) -> Result<Vec<Option<Record>>> {
        let missing = keys
            .iter()
            .filter(|key| !self.mutations.contains_key(*key))
            .cloned()
            .collect::<Vec<_>>();
        let fetched = self.store.get_multi(missing.clone()).await?;

        let fetched = missing.into_iter().zip(fetched).collect::<BTreeMap<_, _>>();
        for (key, record) in fetched.iter() {
            self.reads
                .entry(key.clone())
                .or_insert_with(|| record.as_ref().map(|r| r.version));
        }

        let res = keys
            .into_iter()
            .map(|key| match self.mutations.get(&key) {
                Some(Mutation::Put(record)) => Some(record.clone()),
                Some(Mutation::Delete(_)) => None,
                None => fetched.get(&key).cloned().flatten(),
            })
            .collect();
        Ok(res)
    }

    /// Buffer an insert or overwrite.
    pub fn put(&mut self, record: Record) {
        self.mutations.insert(record.key.clone(), Mutation::Put(record));
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: RecordKey) {
        self.mutations.insert(key.clone(), Mutation::Delete(key));
    }

    /// Returns `true` if nothing has been written.
    pub fn is_read_only(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Apply every buffered write atomically, or none of them.
    pub async fn commit(self) -> Result<()> {
        if self.mutations.is_empty() {
            return Ok(());
        }
        let commit = Commit {
            reads: self.reads.into_iter().collect(),
            mutations: self.mutations.into_values().collect(),
        };
        self.store.commit(commit).await
    }
}
