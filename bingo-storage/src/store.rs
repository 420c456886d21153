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

use std::fmt::Debug;

use bingo_common::error::Result;
use futures_core::future::BoxFuture;

use crate::record::{Filter, Record, RecordKey};

/// A buffered write of a [`Commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert or overwrite the record.
    Put(Record),
    /// Delete the record if it exists.
    Delete(RecordKey),
}

impl Mutation {
    /// The key the mutation applies to.
    pub fn key(&self) -> &RecordKey {
        match self {
            Mutation::Put(record) => &record.key,
            Mutation::Delete(key) => key,
        }
    }
}

/// The all-or-nothing unit applied by [`DurableStore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    /// Versions observed by the transaction, `None` if the record was absent.
    pub reads: Vec<(RecordKey, Option<u64>)>,
    /// Writes to apply if every read is still current.
    pub mutations: Vec<Mutation>,
}

/// Durable record store, the source of truth.
pub trait DurableStore: Send + Sync + Debug + 'static {
    /// Fetch records by key, in the order of the given keys.
    fn get_multi(&self, keys: Vec<RecordKey>) -> BoxFuture<'static, Result<Vec<Option<Record>>>>;

    /// Insert or overwrite records. The stored versions are assigned by the store.
    fn put_multi(&self, records: Vec<Record>) -> BoxFuture<'static, Result<()>>;

    /// Delete records.
    fn delete_multi(&self, keys: Vec<RecordKey>) -> BoxFuture<'static, Result<()>>;

    /// Scan every record of the given kind that matches the filter.
    fn scan(&self, kind: String, filter: Filter) -> BoxFuture<'static, Result<Vec<Record>>>;

    /// Apply the commit atomically.
    ///
    /// Fails with [`bingo_common::error::ErrorKind::TransactionConflict`] without applying anything if any read
    /// record changed since it was read.
    fn commit(&self, commit: Commit) -> BoxFuture<'static, Result<()>>;

    /// Fetch a single record.
    fn get(&self, key: RecordKey) -> BoxFuture<'static, Result<Option<Record>>> {
        let future = self.get_multi(vec![key]);
        Box::pin(async move { Ok(future.await?.pop().flatten()) })
    }
}
