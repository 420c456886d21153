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

use bingo_common::error::{Error, Result};
use futures_core::future::BoxFuture;
use itertools::Itertools;
use parking_lot::Mutex;

use crate::{
    record::{Filter, Record, RecordKey},
    store::{Commit, DurableStore, Mutation},
};

#[derive(Debug, Default)]
struct MemoryDurableStoreInner {
    records: BTreeMap<RecordKey, Record>,
    version: u64,
}

impl MemoryDurableStoreInner {
    fn put(&mut self, mut record: Record) {
        self.version += 1;
        record.version = self.version;
        self.records.insert(record.key.clone(), record);
    }
}

/// In-process [`DurableStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    inner: Arc<Mutex<MemoryDurableStoreInner>>,
}

impl MemoryDurableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of records of the given kind.
    pub fn count(&self, kind: &str) -> usize {
        self.inner.lock().records.keys().filter(|key| key.kind == kind).count()
    }

    /// Names of the records of the given kind, sorted.
    pub fn names(&self, kind: &str) -> Vec<String> {
        self.inner
            .lock()
            .records
            .keys()
            .filter(|key| key.kind == kind)
            .map(|key| key.name.clone())
            .collect()
    }
}

impl DurableStore for MemoryDurableStore {
    fn get_multi(&self, keys: Vec<RecordKey>) -> BoxFuture<'static, Result<Vec<Option<Record>>>> {
        let inner = self.inner.lock();
        let res = keys.iter().map(|key| inner.records.get(key).cloned()).collect();
        Box::pin(async move { Ok(res) })
    }

    fn put_multi(&self, records: Vec<Record>) -> BoxFuture<'static, Result<()>> {
        let mut inner = self.inner.lock();
        for record in records {
            inner.put(record);
        }
        Box::pin(async move { Ok(()) })
    }

    fn delete_multi(&self, keys: Vec<RecordKey>) -> BoxFuture<'static, Result<()>> {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.records.remove(&key);
        }
        Box::pin(async move { Ok(()) })
    }

    fn scan(&self, kind: String, filter: Filter) -> BoxFuture<'static, Result<Vec<Record>>> {
        let inner = self.inner.lock();
        let res = inner
            .records
            .values()
            .filter(|record| record.key.kind == kind && filter.matches(record))
            .cloned()
            .collect_vec();
        Box::pin(async move { Ok(res) })
    }

    fn commit(&self, commit: Commit) -> BoxFuture<'static, Result<()>> {
        let mut inner = self.inner.lock();

        let conflict = commit
            .reads
            .iter()
            .find(|(key, version)| inner.records.get(key).map(|r| r.version) != *version);
        if let Some((key, _)) = conflict {
            tracing::debug!("[memory durable store]: transaction conflict on {key}");
            let err = Error::conflict(&key.kind, &key.name);
            return Box::pin(async move { Err(err) });
        }

        for mutation in commit.mutations {
            match mutation {
                Mutation::Put(record) => inner.put(record),
                Mutation::Delete(key) => {
                    inner.records.remove(&key);
                }
            }
        }
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use bingo_common::error::ErrorKind;
    use bytes::Bytes;

    use super::*;
    use crate::Transaction;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<MemoryDurableStore>();
        is_send_sync_static::<Arc<dyn DurableStore>>();
    }

    fn record(kind: &str, name: &str, archived: bool, payload: &'static [u8]) -> Record {
        Record::new(
            RecordKey::new(kind, name),
            BTreeMap::from([("archived".to_string(), archived.to_string())]),
            Bytes::from_static(payload),
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_put_get_scan() {
        let store = MemoryDurableStore::new();
        store
            .put_multi(vec![
                record("Experiment", "a", false, b"a"),
                record("Experiment", "b", true, b"b"),
                record("Alternative", "a:0", false, b"a0"),
            ])
            .await
            .unwrap();

        let got = store.get(RecordKey::new("Experiment", "a")).await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"a"));
        assert!(got.version > 0);

        let live = store
            .scan("Experiment".to_string(), Filter::all().equals("archived", false))
            .await
            .unwrap();
        assert_eq!(live.iter().map(|r| r.key.name.as_str()).collect_vec(), vec!["a"]);

        store.delete_multi(vec![RecordKey::new("Experiment", "a")]).await.unwrap();
        assert_eq!(store.count("Experiment"), 1);
        assert_eq!(store.names("Alternative"), vec!["a:0"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_transaction_read_your_writes() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryDurableStore::new());

        let mut txn = Transaction::begin(store.clone());
        assert!(txn.get(RecordKey::new("Experiment", "a")).await.unwrap().is_none());
        txn.put(record("Experiment", "a", false, b"a"));
        assert!(txn.get(RecordKey::new("Experiment", "a")).await.unwrap().is_some());
        txn.delete(RecordKey::new("Experiment", "a"));
        assert!(txn.get(RecordKey::new("Experiment", "a")).await.unwrap().is_none());
        txn.put(record("Experiment", "a", false, b"a"));
        txn.put(record("Alternative", "a:0", false, b"a0"));
        txn.commit().await.unwrap();

        let got = store
            .get_multi(vec![RecordKey::new("Experiment", "a"), RecordKey::new("Alternative", "a:0")])
            .await
            .unwrap();
        assert!(got.iter().all(|r| r.is_some()));
    }

    #[test_log::test(tokio::test)]
    async fn test_transaction_conflict_is_all_or_nothing() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryDurableStore::new());
        store.put_multi(vec![record("Experiment", "a", false, b"v1")]).await.unwrap();

        let mut t1 = Transaction::begin(store.clone());
        let mut t2 = Transaction::begin(store.clone());
        t1.get(RecordKey::new("Experiment", "a")).await.unwrap();
        t2.get(RecordKey::new("Experiment", "a")).await.unwrap();

        t1.put(record("Experiment", "a", false, b"v2"));
        t1.commit().await.unwrap();

        t2.put(record("Experiment", "a", false, b"v3"));
        t2.put(record("Alternative", "a:0", false, b"a0"));
        let err = t2.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionConflict);

        let got = store.get(RecordKey::new("Experiment", "a")).await.unwrap().unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"v2"));
        assert!(store.get(RecordKey::new("Alternative", "a:0")).await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_insert_if_absent_conflict() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryDurableStore::new());

        let mut t1 = Transaction::begin(store.clone());
        let mut t2 = Transaction::begin(store.clone());
        assert!(t1.get(RecordKey::new("Experiment", "a")).await.unwrap().is_none());
        assert!(t2.get(RecordKey::new("Experiment", "a")).await.unwrap().is_none());
        t1.put(record("Experiment", "a", false, b"t1"));
        t2.put(record("Experiment", "a", false, b"t2"));

        t1.commit().await.unwrap();
        assert_eq!(t2.commit().await.unwrap_err().kind(), ErrorKind::TransactionConflict);
    }
}
