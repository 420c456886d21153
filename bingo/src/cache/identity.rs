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

//! Per-identity participation history.
//!
//! Histories are read through the same tiers as the catalog. Writes go to the shared and process-local tiers and
//! are appended to one of a fixed number of identity buckets in the volatile cache; a bucket is written to the
//! durable store in one batch once it grows past the flush threshold or when the reconciliation loop sweeps it.
//! Durable writes merge with the stored history, so a record written by both a flush and its writer is harmless.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bingo_common::{
    code::SnapshotCodec,
    error::{ErrorKind, Result},
    hasher::bucket_of,
};
use bingo_memory::{parse_integer, LocalCache, VolatileCache};
use bingo_storage::{DurableStore, Entity, Transaction};
use bytes::Bytes;
use itertools::Itertools;

use crate::{cache::KeySpace, model::IdentityRecord};

const MERGE_ATTEMPTS: usize = 3;

/// History of the identity of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHistory {
    record: IdentityRecord,
    dirty: bool,
}

impl IdentityHistory {
    fn new(record: IdentityRecord) -> Self {
        Self { record, dirty: false }
    }

    /// The history as loaded, including unsaved changes.
    pub fn record(&self) -> &IdentityRecord {
        &self.record
    }

    /// Returns `true` if the history has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn participate(&mut self, experiment: &str) -> bool {
        let added = self.record.participate(experiment);
        self.dirty |= added;
        added
    }

    pub(crate) fn convert(&mut self, experiment: &str) {
        self.record.convert(experiment);
        self.dirty = true;
    }
}

/// Options of the identity buckets.
#[derive(Debug, Clone)]
pub struct BucketOptions {
    /// Count of buckets.
    pub buckets: usize,
    /// Pending records that trigger a flush of a bucket.
    pub flush_threshold: u64,
    /// Expiry of the flush lock of a bucket.
    pub lock_ttl: Duration,
}

/// Layered cache of identity histories.
#[derive(Debug)]
pub struct IdentityCache {
    keys: KeySpace,
    volatile: Arc<dyn VolatileCache>,
    store: Arc<dyn DurableStore>,
    local: LocalCache<String, Arc<IdentityRecord>>,
    codec: SnapshotCodec,
    options: BucketOptions,
}

impl IdentityCache {
    /// Create an identity cache.
    pub fn new(
        keys: KeySpace,
        volatile: Arc<dyn VolatileCache>,
        store: Arc<dyn DurableStore>,
        local: LocalCache<String, Arc<IdentityRecord>>,
        codec: SnapshotCodec,
        options: BucketOptions,
    ) -> Self {
        Self {
            keys,
            volatile,
            store,
            local,
            codec,
            options,
        }
    }

    /// Load the history of an identity, empty if it never participated.
    pub async fn load(&self, identity: &str) -> Result<IdentityHistory> {
        if let Some(record) = self.local.get(identity) {
            return Ok(IdentityHistory::new(record.as_ref().clone()));
        }

        let key = self.keys.identity(identity);
        if let Some(buf) = self.volatile.get(key.clone()).await? {
            match self.codec.decode::<IdentityRecord>(&buf) {
                Ok(record) => {
                    self.local.insert(identity.to_string(), Arc::new(record.clone()));
                    return Ok(IdentityHistory::new(record));
                }
                Err(e) => tracing::warn!("[identity cache]: drop undecodable shared history {key}, error: {e}"),
            }
        }

        let record = match self.store.get(IdentityRecord::key_of(identity)).await? {
            Some(record) => IdentityRecord::from_record(&record)?,
            None => IdentityRecord::new(identity),
        };
        self.local.insert(identity.to_string(), Arc::new(record.clone()));
        Ok(IdentityHistory::new(record))
    }

    /// Write the history to the shared and process-local tiers and queue it for the durable store, if changed.
    ///
    /// Returns `true` if anything was written.
    pub async fn store_if_dirty(&self, history: &mut IdentityHistory) -> Result<bool> {
        if !history.dirty {
            return Ok(false);
        }
        let identity = history.record.identity.clone();
        let buf = Bytes::from(self.codec.encode(&history.record)?);

        self.volatile.set(self.keys.identity(&identity), buf.clone(), None).await?;
        self.local.insert(identity, Arc::new(history.record.clone()));
        self.append(&history.record, buf).await?;

        history.dirty = false;
        Ok(true)
    }

    async fn append(&self, record: &IdentityRecord, buf: Bytes) -> Result<()> {
        let bucket = bucket_of(&record.identity, self.options.buckets);
        let Some(tail) = self.volatile.incr(self.keys.bucket_tail(bucket), 1, Some(0)).await? else {
            return Ok(());
        };
        let slot = self.keys.bucket_slot(bucket, tail);
        self.volatile.set(slot.clone(), buf, None).await?;

        // A flush that claimed the slot before it was written may have missed it.
        let head = self.read_integer(self.keys.bucket_head(bucket)).await?;
        if head >= tail {
            tracing::debug!("[identity bucket]: slot {slot} was claimed by a flush, write it through");
            self.write_merged(vec![record.clone()]).await?;
            self.volatile.delete(slot).await?;
            return Ok(());
        }

        if tail - head >= self.options.flush_threshold {
            self.flush_bucket(bucket).await?;
        }
        Ok(())
    }

    async fn read_integer(&self, key: String) -> Result<u64> {
        match self.volatile.get(key.clone()).await? {
            Some(buf) => parse_integer(&key, &buf),
            None => Ok(0),
        }
    }

    /// Write records to the durable store, merged with what is already stored.
    async fn write_merged(&self, records: Vec<IdentityRecord>) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut txn = Transaction::begin(self.store.clone());
            let stored = txn.get_multi(records.iter().map(|record| record.key()).collect()).await?;
            for (record, stored) in records.iter().zip(stored) {
                let mut record = record.clone();
                if let Some(stored) = stored {
                    record.merge(IdentityRecord::from_record(&stored)?);
                }
                txn.put(record.to_record()?);
            }
            match txn.commit().await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::TransactionConflict && attempts < MERGE_ATTEMPTS => {
                    tracing::trace!("[identity bucket]: histories changed while merging, retry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write the pending records of a bucket to the durable store.
    ///
    /// Returns the count of records written, zero if another worker is flushing the bucket.
    pub async fn flush_bucket(&self, bucket: usize) -> Result<usize> {
        let lock = self.keys.bucket_lock(bucket);
        if !self
            .volatile
            .add(lock.clone(), Bytes::from_static(b"1"), Some(self.options.lock_ttl))
            .await?
        {
            tracing::debug!("[identity bucket]: bucket {bucket} is being flushed by another worker, skip");
            return Ok(0);
        }
        let res = self.flush_bucket_locked(bucket).await;
        self.volatile.delete(lock).await?;
        res
    }

    async fn flush_bucket_locked(&self, bucket: usize) -> Result<usize> {
        let head_key = self.keys.bucket_head(bucket);
        let stored_head = self.read_integer(head_key.clone()).await?;
        let tail = self.read_integer(self.keys.bucket_tail(bucket)).await?;
        // The tail restarts from zero if it was evicted.
        let head = if stored_head > tail { 0 } else { stored_head };
        if head == tail {
            return Ok(0);
        }

        // Claim the slots before reading them. A writer that finds its slot claimed writes it through itself.
        self.volatile
            .set(head_key.clone(), Bytes::from(tail.to_string()), None)
            .await?;

        let slots = (head + 1..=tail).map(|slot| self.keys.bucket_slot(bucket, slot)).collect_vec();
        let mut bufs = self.volatile.get_multi(slots.clone()).await?;

        let mut records = BTreeMap::new();
        for slot in slots.iter() {
            let Some(buf) = bufs.remove(slot) else {
                tracing::debug!("[identity bucket]: slot {slot} is missing, skip");
                continue;
            };
            match self.codec.decode::<IdentityRecord>(&buf) {
                Ok(record) => {
                    records.insert(record.identity.clone(), record);
                }
                Err(e) => tracing::warn!("[identity bucket]: drop undecodable slot {slot}, error: {e}"),
            }
        }

        let count = records.len();
        if let Err(e) = self.write_merged(records.into_values().collect()).await {
            // Hand the slots back to the next flush.
            if let Err(restore) = self
                .volatile
                .set(head_key, Bytes::from(stored_head.to_string()), None)
                .await
            {
                tracing::warn!("[identity bucket]: fail to restore the head of bucket {bucket}, error: {restore}");
            }
            return Err(e);
        }
        self.volatile.delete_multi(slots).await?;

        tracing::debug!("[identity bucket]: flushed {count} records of bucket {bucket}");
        Ok(count)
    }

    /// Flush every bucket.
    pub async fn flush_all(&self) -> Result<usize> {
        let mut count = 0;
        for bucket in 0..self.options.buckets {
            count += self.flush_bucket(bucket).await?;
        }
        Ok(count)
    }
}
