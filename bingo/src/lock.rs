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

//! Persist lock: one reconciliation run or one administrative mutation at a time.
//!
//! The lock is a single durable record carrying an expiry timestamp. A non-expired timestamp means held. A holder
//! that crashes loses the lock once the timestamp passes.

use std::{sync::Arc, time::Duration};

use bingo_common::{
    clock::Clock,
    error::{Error, ErrorKind, Result},
};
use bingo_storage::{DurableStore, Entity, Transaction};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PersistLockRecord {
    name: String,
    expires_at: Option<u64>,
}

impl Entity for PersistLockRecord {
    const KIND: &'static str = "PersistLock";

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Durable mutual exclusion lock with expiry.
#[derive(Debug, Clone)]
pub struct PersistLock {
    name: String,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    spin_interval: Duration,
}

impl PersistLock {
    /// Create a handle of the lock with the given name.
    pub fn new(name: impl Into<String>, store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            store,
            clock,
            spin_interval: Duration::from_millis(100),
        }
    }

    /// Set the pause between attempts of [`PersistLock::spin_and_take`].
    ///
    /// Default: `100ms`.
    pub fn with_spin_interval(mut self, spin_interval: Duration) -> Self {
        self.spin_interval = spin_interval;
        self
    }

    async fn record(&self) -> Result<Option<PersistLockRecord>> {
        match self.store.get(PersistLockRecord::key_of(&self.name)).await? {
            Some(record) => Ok(Some(PersistLockRecord::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Expiry of the current holder, `None` if the lock was released or never taken.
    pub async fn expires_at(&self) -> Result<Option<u64>> {
        Ok(self.record().await?.and_then(|record| record.expires_at))
    }

    /// Returns `true` if the lock is held and not expired.
    pub async fn is_held(&self) -> Result<bool> {
        let now = self.clock.now_millis();
        Ok(self.expires_at().await?.is_some_and(|expires_at| expires_at > now))
    }

    /// Try to take the lock once, holding it for `timeout` unless released earlier.
    ///
    /// Returns `false` if the lock is held by someone else. Losing a race against another taker is not an error.
    pub async fn take(&self, timeout: Duration) -> Result<bool> {
        Ok(self.try_take(timeout).await?.is_some())
    }

    /// Like [`PersistLock::take`], returning the expiry stamp of the new hold.
    ///
    /// The stamp identifies the hold: see [`PersistLock::is_held_by`] and [`PersistLock::release_held`].
    pub async fn try_take(&self, timeout: Duration) -> Result<Option<u64>> {
        let mut txn = Transaction::begin(self.store.clone());
        let current = match txn.get(PersistLockRecord::key_of(&self.name)).await? {
            Some(record) => PersistLockRecord::from_record(&record)?.expires_at,
            None => None,
        };

        let now = self.clock.now_millis();
        if current.is_some_and(|expires_at| expires_at > now) {
            return Ok(None);
        }

        let stamp = self.clock.deadline(timeout);
        let record = PersistLockRecord {
            name: self.name.clone(),
            expires_at: Some(stamp),
        };
        txn.put(record.to_record()?);
        match txn.commit().await {
            Ok(()) => {
                tracing::trace!("[persist lock]: {} taken for {timeout:?}", self.name);
                Ok(Some(stamp))
            }
            Err(e) if e.kind() == ErrorKind::TransactionConflict => {
                tracing::trace!("[persist lock]: {} taken concurrently by another worker", self.name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Retry [`PersistLock::take`] until it succeeds or `budget` elapses.
    ///
    /// Returns the expiry stamp of the hold. Fails with [`ErrorKind::LockTimeout`] once the budget is exhausted.
    pub async fn spin_and_take(&self, budget: Duration, timeout: Duration) -> Result<u64> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if let Some(stamp) = self.try_take(timeout).await? {
                return Ok(stamp);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!("[persist lock]: {} is still held after {budget:?}, give up", self.name);
                return Err(Error::lock_timeout(budget).with_context("lock", &self.name));
            }
            tokio::time::sleep(self.spin_interval.min(deadline - now)).await;
        }
    }

    /// Release the lock. Releasing a released or expired lock is a no-op.
    pub async fn release(&self) -> Result<()> {
        let record = PersistLockRecord {
            name: self.name.clone(),
            expires_at: None,
        };
        self.store.put_multi(vec![record.to_record()?]).await?;
        tracing::trace!("[persist lock]: {} released", self.name);
        Ok(())
    }

    /// Returns `true` if the hold with the given stamp is still the current one and not expired.
    pub async fn is_held_by(&self, stamp: u64) -> Result<bool> {
        let now = self.clock.now_millis();
        Ok(stamp > now && self.expires_at().await? == Some(stamp))
    }

    /// Release the hold with the given stamp. A hold that expired and was taken over is left alone.
    ///
    /// Returns `true` if the lock was released.
    pub async fn release_held(&self, stamp: u64) -> Result<bool> {
        let mut txn = Transaction::begin(self.store.clone());
        let current = match txn.get(PersistLockRecord::key_of(&self.name)).await? {
            Some(record) => PersistLockRecord::from_record(&record)?.expires_at,
            None => None,
        };
        if current != Some(stamp) {
            tracing::debug!("[persist lock]: {} is no longer held with stamp {stamp}, skip release", self.name);
            return Ok(false);
        }

        let record = PersistLockRecord {
            name: self.name.clone(),
            expires_at: None,
        };
        txn.put(record.to_record()?);
        match txn.commit().await {
            Ok(()) => {
                tracing::trace!("[persist lock]: {} released", self.name);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::TransactionConflict => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bingo_common::clock::{ManualClock, SystemClock};
    use bingo_storage::MemoryDurableStore;

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<PersistLock>();
    }

    #[test_log::test(tokio::test)]
    async fn test_take_and_release() {
        let store = Arc::new(MemoryDurableStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let lock = PersistLock::new("bingo", store.clone(), clock.clone());
        let other = PersistLock::new("bingo", store.clone(), clock.clone());
        let unrelated = PersistLock::new("other", store, clock.clone());

        assert!(!lock.is_held().await.unwrap());
        assert!(lock.take(Duration::from_secs(60)).await.unwrap());
        assert!(lock.is_held().await.unwrap());
        assert_eq!(lock.expires_at().await.unwrap(), Some(61_000));
        assert!(!other.take(Duration::from_secs(60)).await.unwrap());
        assert!(unrelated.take(Duration::from_secs(60)).await.unwrap());

        lock.release().await.unwrap();
        assert!(!lock.is_held().await.unwrap());
        lock.release().await.unwrap();
        assert!(other.take(Duration::from_secs(60)).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_expiry_reclaims_lock() {
        let store = Arc::new(MemoryDurableStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let crashed = PersistLock::new("bingo", store.clone(), clock.clone());
        let lock = PersistLock::new("bingo", store, clock.clone());

        assert!(crashed.take(Duration::from_secs(60)).await.unwrap());
        clock.advance(Duration::from_secs(59));
        assert!(!lock.take(Duration::from_secs(60)).await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert!(lock.take(Duration::from_secs(60)).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_release_held_spares_the_next_holder() {
        let store = Arc::new(MemoryDurableStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let slow = PersistLock::new("bingo", store.clone(), clock.clone());
        let next = PersistLock::new("bingo", store, clock.clone());

        let stamp = slow.try_take(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(stamp, 10_000);
        assert!(slow.is_held_by(stamp).await.unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(!slow.is_held_by(stamp).await.unwrap());
        let taken = next.try_take(Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(!slow.is_held_by(stamp).await.unwrap());
        assert!(!slow.release_held(stamp).await.unwrap());
        assert!(next.is_held_by(taken).await.unwrap());

        assert!(next.release_held(taken).await.unwrap());
        assert!(!next.is_held().await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn test_spin_and_take_times_out() {
        let store = Arc::new(MemoryDurableStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let holder = PersistLock::new("bingo", store.clone(), clock.clone());
        let lock = PersistLock::new("bingo", store, clock).with_spin_interval(Duration::from_millis(5));

        assert!(holder.take(Duration::from_secs(60)).await.unwrap());
        let err = lock
            .spin_and_take(Duration::from_millis(50), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }

    #[test_log::test(tokio::test)]
    async fn test_spin_and_take_waits_for_release() {
        let store = Arc::new(MemoryDurableStore::new());
        let clock = Arc::new(SystemClock);
        let holder = PersistLock::new("bingo", store.clone(), clock.clone());
        let lock = PersistLock::new("bingo", store, clock).with_spin_interval(Duration::from_millis(5));

        assert!(holder.take(Duration::from_secs(60)).await.unwrap());
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            holder.release().await
        });
        lock.spin_and_take(Duration::from_secs(5), Duration::from_secs(60))
            .await
            .unwrap();
        release.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_spin_and_take_mutual_exclusion() {
        let store = Arc::new(MemoryDurableStore::new());
        let clock = Arc::new(SystemClock);
        let inside = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let lock =
                    PersistLock::new("bingo", store.clone(), clock.clone()).with_spin_interval(Duration::from_millis(1));
                let inside = inside.clone();
                let entered = entered.clone();
                tokio::spawn(async move {
                    lock.spin_and_take(Duration::from_secs(10), Duration::from_secs(60))
                        .await
                        .unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                    entered.fetch_add(1, Ordering::SeqCst);
                    lock.release().await.unwrap();
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 8);
    }
}
