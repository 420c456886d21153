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

//! The experiment catalog, cached as an immutable snapshot.

use std::{collections::BTreeMap, sync::Arc};

use bingo_common::{code::SnapshotCodec, error::Result};
use bingo_memory::{LocalCache, RequestMemo, VolatileCache};
use bingo_storage::{DurableStore, Entity, Filter};
use bytes::Bytes;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    cache::KeySpace,
    model::{Alternative, Experiment},
};

/// Which catalog snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogScope {
    /// Live and stopped experiments.
    Live,
    /// Archived experiments, read only.
    Archived,
}

impl CatalogScope {
    fn archived(&self) -> bool {
        matches!(self, CatalogScope::Archived)
    }
}

/// An experiment with its alternatives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// The experiment.
    pub experiment: Experiment,
    /// Alternatives in ordinal order.
    pub alternatives: Vec<Alternative>,
}

impl CatalogEntry {
    /// The alternative with the given ordinal.
    pub fn alternative(&self, number: u8) -> Option<&Alternative> {
        self.alternatives.iter().find(|alternative| alternative.number == number)
    }

    /// `(ordinal, weight)` of every alternative.
    pub fn weights(&self) -> Vec<(u8, u32)> {
        self.alternatives
            .iter()
            .map(|alternative| (alternative.number, alternative.weight))
            .collect()
    }
}

/// Immutable snapshot of the experiment catalog, keyed by experiment record name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    /// Assemble a catalog from durable records. Alternatives without an experiment are ignored.
    pub fn from_records(experiments: Vec<Experiment>, alternatives: Vec<Alternative>) -> Self {
        let mut entries = experiments
            .into_iter()
            .map(|experiment| {
                let entry = CatalogEntry {
                    experiment,
                    alternatives: vec![],
                };
                (Entity::name(&entry.experiment), entry)
            })
            .collect::<BTreeMap<_, _>>();
        for alternative in alternatives {
            match entries.get_mut(&alternative.experiment) {
                Some(entry) => entry.alternatives.push(alternative),
                None => tracing::debug!(
                    "[catalog]: ignore orphan alternative {}",
                    Entity::name(&alternative)
                ),
            }
        }
        for entry in entries.values_mut() {
            entry.alternatives.sort_by_key(|alternative| alternative.number);
        }
        Self { entries }
    }

    /// The experiment with the given record name.
    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    /// Every experiment sharing the canonical name.
    pub fn family(&self, canonical: &str) -> Vec<&CatalogEntry> {
        self.entries
            .values()
            .filter(|entry| entry.experiment.canonical_name == canonical)
            .collect()
    }

    /// Resolve a name to experiments: an experiment name, else a canonical family name, else a conversion name.
    pub fn resolve(&self, name: &str) -> Vec<&CatalogEntry> {
        if let Some(entry) = self.get(name) {
            return vec![entry];
        }
        let family = self.family(name);
        if !family.is_empty() {
            return family;
        }
        self.entries
            .values()
            .filter(|entry| entry.experiment.conversion.name == name)
            .collect()
    }

    /// Every experiment.
    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    /// Count of experiments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the catalog holds no experiment.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Begin a change set over this snapshot.
    pub fn begin(self: &Arc<Self>) -> CatalogTxn {
        CatalogTxn {
            base: self.clone(),
            changed: BTreeMap::new(),
        }
    }
}

/// Change set over a catalog snapshot. Nothing is visible until committed.
#[derive(Debug)]
#[must_use = "catalog changes are lost unless committed"]
pub struct CatalogTxn {
    base: Arc<Catalog>,
    changed: BTreeMap<String, CatalogEntry>,
}

impl CatalogTxn {
    /// Fold drained counter deltas into the durable totals of an alternative.
    ///
    /// Returns `false` if the alternative is not in the catalog.
    pub fn add_totals(&mut self, experiment: &str, number: u8, participants: u64, conversions: u64) -> bool {
        if participants == 0 && conversions == 0 {
            return self.base.get(experiment).and_then(|e| e.alternative(number)).is_some();
        }
        if !self.changed.contains_key(experiment) {
            let Some(entry) = self.base.get(experiment) else {
                return false;
            };
            self.changed.insert(experiment.to_string(), entry.clone());
        }
        let Some(entry) = self.changed.get_mut(experiment) else {
            return false;
        };
        match entry.alternatives.iter_mut().find(|alternative| alternative.number == number) {
            Some(alternative) => {
                alternative.participants += participants;
                alternative.conversions += conversions;
                true
            }
            None => false,
        }
    }

    /// Returns `true` if anything changed.
    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty()
    }

    fn into_parts(self) -> (Arc<Catalog>, Vec<Alternative>) {
        if self.changed.is_empty() {
            return (self.base, vec![]);
        }
        let alternatives = self
            .changed
            .values()
            .flat_map(|entry| entry.alternatives.iter().cloned())
            .collect_vec();
        let mut catalog = self.base.as_ref().clone();
        catalog.entries.extend(self.changed);
        (Arc::new(catalog), alternatives)
    }
}

/// Per-request memo of catalog snapshots.
pub type CatalogMemo = RequestMemo<CatalogScope, Arc<Catalog>>;

/// Layered cache of the catalog snapshots.
#[derive(Debug)]
pub struct CatalogCache {
    keys: KeySpace,
    volatile: Arc<dyn VolatileCache>,
    store: Arc<dyn DurableStore>,
    local: LocalCache<CatalogScope, Arc<Catalog>>,
    codec: SnapshotCodec,
}

impl CatalogCache {
    /// Create a catalog cache.
    pub fn new(
        keys: KeySpace,
        volatile: Arc<dyn VolatileCache>,
        store: Arc<dyn DurableStore>,
        local: LocalCache<CatalogScope, Arc<Catalog>>,
        codec: SnapshotCodec,
    ) -> Self {
        Self {
            keys,
            volatile,
            store,
            local,
            codec,
        }
    }

    /// Get a catalog snapshot through every tier.
    pub async fn get(&self, memo: &mut CatalogMemo, scope: CatalogScope) -> Result<Arc<Catalog>> {
        if let Some(catalog) = memo.get(&scope) {
            return Ok(catalog.clone());
        }

        let catalog = match self.local.get(&scope) {
            Some(catalog) => catalog,
            None => match self.fetch_shared(scope).await? {
                Some(catalog) => {
                    let catalog = Arc::new(catalog);
                    self.local.insert(scope, catalog.clone());
                    catalog
                }
                None => self.refresh(scope).await?,
            },
        };

        memo.insert(scope, catalog.clone());
        Ok(catalog)
    }

    async fn fetch_shared(&self, scope: CatalogScope) -> Result<Option<Catalog>> {
        let key = self.keys.catalog(scope);
        let Some(buf) = self.volatile.get(key.clone()).await? else {
            tracing::trace!("[catalog]: shared snapshot miss, key: {key}");
            return Ok(None);
        };
        match self.codec.decode(&buf) {
            Ok(catalog) => Ok(Some(catalog)),
            Err(e) => {
                tracing::warn!("[catalog]: drop undecodable shared snapshot {key}, error: {e}");
                Ok(None)
            }
        }
    }

    /// Rebuild a catalog snapshot from the durable store.
    pub async fn load(&self, scope: CatalogScope) -> Result<Catalog> {
        let filter = Filter::all().equals("archived", scope.archived());
        let (experiments, alternatives) = futures_util::future::try_join(
            self.store.scan(Experiment::KIND.to_string(), filter.clone()),
            self.store.scan(Alternative::KIND.to_string(), filter),
        )
        .await?;
        let experiments = experiments
            .iter()
            .map(Experiment::from_record)
            .collect::<Result<Vec<_>>>()?;
        let alternatives = alternatives
            .iter()
            .map(Alternative::from_record)
            .collect::<Result<Vec<_>>>()?;
        let catalog = Catalog::from_records(experiments, alternatives);
        tracing::debug!("[catalog]: loaded {scope:?} catalog with {} experiments", catalog.len());
        Ok(catalog)
    }

    /// Write a snapshot to the shared and process-local tiers.
    pub async fn publish(&self, scope: CatalogScope, catalog: Arc<Catalog>) -> Result<()> {
        let buf = self.codec.encode(catalog.as_ref())?;
        self.volatile.set(self.keys.catalog(scope), Bytes::from(buf), None).await?;
        self.local.insert(scope, catalog);
        Ok(())
    }

    /// Reload a snapshot from the durable store and publish it.
    pub async fn refresh(&self, scope: CatalogScope) -> Result<Arc<Catalog>> {
        let catalog = Arc::new(self.load(scope).await?);
        self.publish(scope, catalog.clone()).await?;
        Ok(catalog)
    }

    /// Persist a change set to the durable store and publish the resulting live snapshot.
    pub async fn commit(&self, txn: CatalogTxn) -> Result<Arc<Catalog>> {
        if !txn.is_dirty() {
            return Ok(txn.base);
        }
        let (catalog, alternatives) = txn.into_parts();
        let records = alternatives
            .iter()
            .map(Alternative::to_record)
            .collect::<Result<Vec<_>>>()?;
        self.store.put_multi(records).await?;
        self.publish(CatalogScope::Live, catalog.clone()).await?;
        Ok(catalog)
    }

}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bingo_common::{clock::ManualClock, code::Compression};
    use bingo_memory::{LocalCacheBuilder, MemoryVolatileCache};
    use bingo_storage::MemoryDurableStore;

    use super::*;
    use crate::model::{Conversion, ExperimentSpec};

    struct Fixture {
        volatile: MemoryVolatileCache,
        store: MemoryDurableStore,
        clock: Arc<ManualClock>,
        cache: CatalogCache,
    }

    fn fixture() -> Fixture {
        let volatile = MemoryVolatileCache::new();
        let store = MemoryDurableStore::new();
        let clock = Arc::new(ManualClock::new(0));
        let local = LocalCacheBuilder::new(16)
            .with_ttl(Duration::from_secs(60))
            .with_clock(clock.clone())
            .build();
        let cache = CatalogCache::new(
            KeySpace::new("test"),
            Arc::new(volatile.clone()),
            Arc::new(store.clone()),
            local,
            SnapshotCodec::new(Compression::Zstd),
        );
        Fixture {
            volatile,
            store,
            clock,
            cache,
        }
    }

    async fn create(store: &MemoryDurableStore, spec: &ExperimentSpec) {
        let mut records = vec![];
        for (experiment, alternatives) in spec.instantiate(0, 0) {
            records.push(experiment.to_record().unwrap());
            for alternative in alternatives {
                records.push(alternative.to_record().unwrap());
            }
        }
        store.put_multi(records).await.unwrap();
    }

    #[test]
    fn test_resolve() {
        let spec = ExperimentSpec::binary("gorillas", ["a", "b"]).with_conversion(Conversion::counting("clicks"));
        let (experiments, alternatives): (Vec<_>, Vec<_>) = spec.instantiate(0, 0).into_iter().unzip();
        let catalog = Catalog::from_records(experiments, alternatives.into_iter().flatten().collect());

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.resolve("gorillas (clicks)").len(), 1);
        assert_eq!(catalog.resolve("gorillas").len(), 2);
        assert_eq!(catalog.resolve("clicks")[0].experiment.name, "gorillas (clicks)");
        assert!(catalog.resolve("monkeys").is_empty());
        assert_eq!(catalog.get("gorillas (clicks)").unwrap().weights(), vec![(0, 1), (1, 1)]);
    }

    #[test_log::test(tokio::test)]
    async fn test_tiers() {
        let f = fixture();
        create(&f.store, &ExperimentSpec::binary("gorillas", ["a", "b", "c"])).await;

        let mut memo = CatalogMemo::new();
        let catalog = f.cache.get(&mut memo, CatalogScope::Live).await.unwrap();
        assert_eq!(catalog.get("gorillas").unwrap().alternatives.len(), 3);
        assert!(f.volatile.keys().contains(&"test:catalog:live".to_string()));

        // The durable store is no longer consulted while the process tier is live.
        create(&f.store, &ExperimentSpec::binary("monkeys", ["a", "b"])).await;
        let mut memo = CatalogMemo::new();
        assert_eq!(f.cache.get(&mut memo, CatalogScope::Live).await.unwrap().len(), 1);

        // Nor once it expires, the shared snapshot answers.
        f.clock.advance(Duration::from_secs(61));
        let mut memo = CatalogMemo::new();
        assert_eq!(f.cache.get(&mut memo, CatalogScope::Live).await.unwrap().len(), 1);

        // A full miss reloads.
        f.clock.advance(Duration::from_secs(61));
        f.volatile.evict_all();
        let mut memo = CatalogMemo::new();
        assert_eq!(f.cache.get(&mut memo, CatalogScope::Live).await.unwrap().len(), 2);

        let archived = f.cache.get(&mut memo, CatalogScope::Archived).await.unwrap();
        assert!(archived.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_request_memo_pins_snapshot() {
        let f = fixture();
        create(&f.store, &ExperimentSpec::binary("gorillas", ["a"])).await;

        let mut memo = CatalogMemo::new();
        let first = f.cache.get(&mut memo, CatalogScope::Live).await.unwrap();
        create(&f.store, &ExperimentSpec::binary("monkeys", ["a"])).await;
        f.cache.refresh(CatalogScope::Live).await.unwrap();

        let second = f.cache.get(&mut memo, CatalogScope::Live).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let fresh = f.cache.get(&mut CatalogMemo::new(), CatalogScope::Live).await.unwrap();
        assert_eq!(fresh.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_undecodable_snapshot_is_a_miss() {
        let f = fixture();
        create(&f.store, &ExperimentSpec::binary("gorillas", ["a"])).await;
        f.volatile
            .set("test:catalog:live".to_string(), Bytes::from_static(b"garbage"), None)
            .await
            .unwrap();
        let catalog = f.cache.get(&mut CatalogMemo::new(), CatalogScope::Live).await.unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_commit_totals() {
        let f = fixture();
        create(&f.store, &ExperimentSpec::binary("gorillas", ["a", "b"])).await;
        let catalog = f.cache.refresh(CatalogScope::Live).await.unwrap();

        let txn = catalog.begin();
        assert!(!txn.is_dirty());
        let same = f.cache.commit(txn).await.unwrap();
        assert!(Arc::ptr_eq(&catalog, &same));

        let mut txn = catalog.begin();
        assert!(txn.add_totals("gorillas", 1, 5, 2));
        assert!(txn.add_totals("gorillas", 1, 1, 0));
        assert!(!txn.add_totals("gorillas", 3, 1, 0));
        assert!(!txn.add_totals("monkeys", 0, 1, 0));
        let committed = f.cache.commit(txn).await.unwrap();

        let alternative = committed.get("gorillas").unwrap().alternative(1).unwrap();
        assert_eq!((alternative.participants, alternative.conversions), (6, 2));
        assert_eq!(catalog.get("gorillas").unwrap().alternative(1).unwrap().participants, 0);

        let reloaded = f.cache.load(CatalogScope::Live).await.unwrap();
        assert_eq!(reloaded.get("gorillas").unwrap().alternative(1).unwrap().participants, 6);
    }
}
