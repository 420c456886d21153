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

use std::{sync::Arc, time::Duration};

use bingo_common::{
    clock::{Clock, SystemClock},
    code::{Compression, SnapshotCodec},
    error::{Error, ErrorKind, Result},
};
use bingo_memory::{LocalCacheBuilder, MemoryVolatileCache, VolatileCache};
use bingo_storage::{DurableStore, MemoryDurableStore};

use crate::{
    cache::{
        catalog::CatalogCache,
        identity::{BucketOptions, IdentityCache},
        KeySpace,
    },
    counter::PackedCounterSet,
    engine::{Bingo, BingoConfig, BingoInner},
    lock::PersistLock,
    scheduler::{RetryPolicy, TaskScheduler, TokioScheduler},
};

/// Where the engine runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Environment {
    /// The reconciliation loop queues its next run after every successful run.
    #[default]
    Production,
    /// The reconciliation loop runs only when triggered.
    Development,
}

/// Builder of [`Bingo`].
pub struct BingoBuilder {
    name: String,
    volatile: Option<Arc<dyn VolatileCache>>,
    store: Option<Arc<dyn DurableStore>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    clock: Arc<dyn Clock>,
    local_ttl: Duration,
    local_capacity: usize,
    compression: Compression,
    identity_buckets: usize,
    bucket_flush_threshold: u64,
    persist_interval: Duration,
    lock_timeout: Duration,
    mutation_budget: Duration,
    spin_interval: Duration,
    retry_policy: RetryPolicy,
    environment: Environment,
}

impl Default for BingoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BingoBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            name: "bingo".to_string(),
            volatile: None,
            store: None,
            scheduler: None,
            clock: Arc::new(SystemClock),
            local_ttl: Duration::from_secs(60),
            local_capacity: 4096,
            compression: Compression::Zstd,
            identity_buckets: 51,
            bucket_flush_threshold: 50,
            persist_interval: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(60),
            mutation_budget: Duration::from_secs(20),
            spin_interval: Duration::from_millis(100),
            retry_policy: RetryPolicy::default(),
            environment: Environment::Production,
        }
    }

    /// Set the instance name.
    ///
    /// Bingo uses the name as the prefix of every key in the volatile cache and as the persist lock name.
    ///
    /// Default: `bingo`.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the shared volatile cache.
    ///
    /// Default: an in-process [`MemoryVolatileCache`].
    pub fn with_volatile_cache(mut self, volatile: Arc<dyn VolatileCache>) -> Self {
        self.volatile = Some(volatile);
        self
    }

    /// Set the durable store.
    ///
    /// Default: an in-process [`MemoryDurableStore`].
    pub fn with_durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the task scheduler of the reconciliation loop.
    ///
    /// Default: a [`TokioScheduler`] on the runtime that calls [`BingoBuilder::build`].
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the clock.
    ///
    /// Default: [`SystemClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the TTL of the process-local tier.
    ///
    /// Processes may disagree about a catalog change for up to this long.
    ///
    /// Default: `60s`.
    pub fn with_local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = ttl;
        self
    }

    /// Set the entry capacity of the process-local tier.
    ///
    /// Default: `4096`.
    pub fn with_local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = capacity;
        self
    }

    /// Set the compression of the snapshots in the volatile cache.
    ///
    /// Default: [`Compression::Zstd`].
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the count of identity buckets.
    ///
    /// Default: `51`.
    pub fn with_identity_buckets(mut self, buckets: usize) -> Self {
        self.identity_buckets = buckets;
        self
    }

    /// Set the count of pending identity records that triggers the flush of a bucket.
    ///
    /// Default: `50`.
    pub fn with_bucket_flush_threshold(mut self, threshold: u64) -> Self {
        self.bucket_flush_threshold = threshold;
        self
    }

    /// Set the delay between chained reconciliation runs.
    ///
    /// Default: `10s`.
    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    /// Set the expiry of the persist lock, after which a crashed holder loses it.
    ///
    /// Default: `60s`.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set how long administrative mutations wait for the persist lock.
    ///
    /// Default: `20s`.
    pub fn with_mutation_budget(mut self, budget: Duration) -> Self {
        self.mutation_budget = budget;
        self
    }

    /// Set the pause between attempts to take a busy lock.
    ///
    /// Default: `100ms`.
    pub fn with_spin_interval(mut self, interval: Duration) -> Self {
        self.spin_interval = interval;
        self
    }

    /// Set the retry policy of the default scheduler. Ignored if a scheduler is set.
    ///
    /// Default: 8 attempts, backoff from 1s up to 60s.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the environment.
    ///
    /// Default: [`Environment::Production`].
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |option: &'static str| {
            Err(Error::new(ErrorKind::Config, "option must be positive").with_context("option", option))
        };
        if self.name.is_empty() {
            return Err(Error::new(ErrorKind::Config, "name must not be empty"));
        }
        if self.local_capacity == 0 {
            return invalid("local_capacity");
        }
        if self.identity_buckets == 0 {
            return invalid("identity_buckets");
        }
        if self.bucket_flush_threshold == 0 {
            return invalid("bucket_flush_threshold");
        }
        if self.lock_timeout.is_zero() {
            return invalid("lock_timeout");
        }
        Ok(())
    }

    /// Build the engine.
    ///
    /// Without an explicit scheduler this must be called within a tokio runtime.
    pub fn build(self) -> Result<Bingo> {
        self.validate()?;

        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?.with_retry_policy(self.retry_policy)),
        };
        let volatile = self
            .volatile
            .unwrap_or_else(|| Arc::new(MemoryVolatileCache::new().with_clock(self.clock.clone())));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryDurableStore::new()));

        let keys = KeySpace::new(self.name.clone());
        let codec = SnapshotCodec::new(self.compression);
        let local = LocalCacheBuilder::new(self.local_capacity)
            .with_ttl(self.local_ttl)
            .with_clock(self.clock.clone());

        let catalog = CatalogCache::new(
            keys.clone(),
            volatile.clone(),
            store.clone(),
            local.clone().build(),
            codec,
        );
        let identities = IdentityCache::new(
            keys.clone(),
            volatile.clone(),
            store.clone(),
            local.build(),
            codec,
            BucketOptions {
                buckets: self.identity_buckets,
                flush_threshold: self.bucket_flush_threshold,
                lock_ttl: self.lock_timeout,
            },
        );
        let lock =
            PersistLock::new(self.name, store.clone(), self.clock.clone()).with_spin_interval(self.spin_interval);

        tracing::debug!(
            "[bingo]: built instance {}, environment: {:?}, compression: {:?}",
            keys.prefix(),
            self.environment,
            self.compression
        );

        Ok(Bingo::new(BingoInner {
            config: BingoConfig {
                persist_interval: self.persist_interval,
                lock_timeout: self.lock_timeout,
                mutation_budget: self.mutation_budget,
                spin_interval: self.spin_interval,
                environment: self.environment,
            },
            keys,
            counters: PackedCounterSet::new(volatile.clone()),
            volatile,
            store,
            scheduler,
            clock: self.clock,
            catalog,
            identities,
            lock,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config() {
        let cases = [
            BingoBuilder::new().with_name(""),
            BingoBuilder::new().with_local_capacity(0),
            BingoBuilder::new().with_identity_buckets(0),
            BingoBuilder::new().with_bucket_flush_threshold(0),
            BingoBuilder::new().with_lock_timeout(Duration::ZERO),
        ];
        for builder in cases {
            assert_eq!(builder.build().unwrap_err().kind(), ErrorKind::Config);
        }
    }

    #[test]
    fn test_build_requires_runtime_without_scheduler() {
        assert_eq!(BingoBuilder::new().build().unwrap_err().kind(), ErrorKind::Scheduler);
    }

    #[test_log::test(tokio::test)]
    async fn test_build() {
        let bingo = BingoBuilder::new().with_name("test").build().unwrap();
        assert_eq!(bingo.name(), "test");
    }
}
