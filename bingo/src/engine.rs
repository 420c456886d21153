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
    clock::Clock,
    error::{Error, Result},
};
use bingo_memory::VolatileCache;
use bingo_storage::{DurableStore, Entity, Filter, Transaction};
use bytes::Bytes;
use itertools::Itertools;

use crate::{
    builder::Environment,
    cache::{
        catalog::{Catalog, CatalogCache, CatalogEntry, CatalogScope},
        identity::IdentityCache,
        KeySpace,
    },
    context::RequestContext,
    counter::PackedCounterSet,
    guard::MutationGuard,
    lock::PersistLock,
    model::{
        Alternative, AlternativeTotals, ConversionKind, Experiment, ExperimentSpec, ExperimentTotals, MAX_ALTERNATIVES,
    },
    persist::{self, ReconcileReport},
    scheduler::{SubmitOutcome, TaskScheduler},
    selector::select,
};

#[derive(Debug, Clone)]
pub(crate) struct BingoConfig {
    pub(crate) persist_interval: Duration,
    pub(crate) lock_timeout: Duration,
    pub(crate) mutation_budget: Duration,
    pub(crate) spin_interval: Duration,
    pub(crate) environment: Environment,
}

#[derive(Debug)]
pub(crate) struct BingoInner {
    pub(crate) config: BingoConfig,
    pub(crate) keys: KeySpace,
    pub(crate) volatile: Arc<dyn VolatileCache>,
    pub(crate) store: Arc<dyn DurableStore>,
    pub(crate) scheduler: Arc<dyn TaskScheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) counters: PackedCounterSet<MAX_ALTERNATIVES>,
    pub(crate) catalog: CatalogCache,
    pub(crate) identities: IdentityCache,
    pub(crate) lock: PersistLock,
}

/// The split testing engine.
///
/// Cheap to clone, every clone shares the same caches and collaborators.
#[derive(Debug, Clone)]
pub struct Bingo {
    inner: Arc<BingoInner>,
}

impl Bingo {
    pub(crate) fn new(inner: BingoInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub(crate) fn inner(&self) -> &Arc<BingoInner> {
        &self.inner
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        self.inner.keys.prefix()
    }

    /// Begin a request on behalf of an identity.
    pub fn context(&self, identity: impl Into<String>) -> RequestContext {
        RequestContext::new(self.inner.clone(), identity)
    }

    /// Get a catalog snapshot.
    pub async fn catalog(&self, ctx: &mut RequestContext, scope: CatalogScope) -> Result<Arc<Catalog>> {
        self.inner.catalog.get(ctx.catalogs(), scope).await
    }

    /// The persist lock shared by the reconciliation loop and the mutation guard.
    pub fn persist_lock(&self) -> &PersistLock {
        &self.inner.lock
    }

    /// Assign the caller to an alternative of the experiment family, creating the family on first use.
    ///
    /// Returns the content of the alternative.
    pub async fn ab_test(&self, ctx: &mut RequestContext, spec: &ExperimentSpec) -> Result<String> {
        spec.validate()?;

        let mut catalog = self.catalog(ctx, CatalogScope::Live).await?;
        let names = spec.experiment_names();
        if names.iter().any(|name| catalog.get(name).is_none()) {
            self.create_family(spec).await?;
            ctx.catalogs().remove(&CatalogScope::Live);
            catalog = self.catalog(ctx, CatalogScope::Live).await?;
        }

        let entries = names.iter().filter_map(|name| catalog.get(name)).collect_vec();
        if entries.is_empty() {
            return Err(Error::not_found("experiment", &spec.name));
        }
        self.assign_entries(ctx, &entries).await
    }

    /// Assign the caller to an alternative of an existing experiment, family or conversion.
    ///
    /// Returns the content of the alternative. Idempotent per identity while the experiment is live.
    pub async fn assign(&self, ctx: &mut RequestContext, name: &str) -> Result<String> {
        let catalog = self.catalog(ctx, CatalogScope::Live).await?;
        let entries = catalog.resolve(name);
        if entries.is_empty() {
            return Err(Error::not_found("experiment", name));
        }
        self.assign_entries(ctx, &entries).await
    }

    async fn assign_entries(&self, ctx: &mut RequestContext, entries: &[&CatalogEntry]) -> Result<String> {
        let first = entries[0];
        let experiment = &first.experiment;

        if let Some(number) = ctx.forced(&experiment.canonical_name) {
            match first.alternative(number) {
                Some(alternative) => return Ok(alternative.content.clone()),
                None => tracing::warn!(
                    "[bingo]: ignore override to unknown alternative {number} of {}",
                    experiment.canonical_name
                ),
            }
        }

        if !experiment.is_live() {
            let number = experiment.short_circuit.unwrap_or_default();
            return first
                .alternative(number)
                .map(|alternative| alternative.content.clone())
                .ok_or_else(|| Error::not_found("alternative", number).with_context("experiment", &experiment.name));
        }

        let number = select(experiment.hashable_name(), ctx.identity(), &first.weights())
            .ok_or_else(|| Error::invalid_argument("experiment has no alternative").with_context("experiment", &experiment.name))?;
        let content = first
            .alternative(number)
            .map(|alternative| alternative.content.clone())
            .ok_or_else(|| Error::not_found("alternative", number).with_context("experiment", &experiment.name))?;

        let history = ctx.history().await?;
        let joined = entries
            .iter()
            .filter(|entry| entry.experiment.is_live())
            .filter(|entry| history.participate(&entry.experiment.history_key()))
            .map(|entry| entry.experiment.name.as_str())
            .collect_vec();
        for name in joined {
            self.inner
                .counters
                .increment(&self.inner.keys.participants(name), number as usize, 1)
                .await?;
        }

        Ok(content)
    }

    /// Record a conversion of the caller for every experiment matching the given experiment, family or conversion
    /// names.
    ///
    /// Binary conversions count once per identity, counting conversions count every call. Identities that do not
    /// participate and experiments that are not live are skipped. Returns the count of conversions recorded.
    pub async fn record_conversion(&self, ctx: &mut RequestContext, names: &[&str]) -> Result<usize> {
        let catalog = self.catalog(ctx, CatalogScope::Live).await?;
        let entries = names
            .iter()
            .flat_map(|name| catalog.resolve(name))
            .unique_by(|entry| entry.experiment.name.clone())
            .collect_vec();
        if entries.is_empty() {
            tracing::trace!("[bingo]: no experiment tracks conversions {names:?}");
            return Ok(0);
        }

        let identity = ctx.identity().to_string();
        let history = ctx.history().await?;
        let mut recorded = 0;
        for entry in entries {
            let experiment = &entry.experiment;
            let history_key = experiment.history_key();
            if !experiment.is_live() || !history.record().is_participating(&history_key) {
                continue;
            }
            if experiment.conversion.kind == ConversionKind::Binary && history.record().conversions(&history_key) > 0
            {
                continue;
            }
            let Some(number) = select(experiment.hashable_name(), &identity, &entry.weights()) else {
                continue;
            };
            self.inner
                .counters
                .increment(&self.inner.keys.conversions(&experiment.name), number as usize, 1)
                .await?;
            history.convert(&history_key);
            recorded += 1;
        }
        Ok(recorded)
    }

    async fn create_family(&self, spec: &ExperimentSpec) -> Result<()> {
        let key = self.inner.keys.creation_lock(&spec.name);
        let budget = self.inner.config.mutation_budget;
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if self
                .inner
                .volatile
                .add(key.clone(), Bytes::from_static(b"1"), Some(self.inner.config.lock_timeout))
                .await?
            {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::lock_timeout(budget).with_context("experiment", &spec.name));
            }
            tracing::trace!("[bingo]: {} is being created by another worker, wait", spec.name);
            tokio::time::sleep(self.inner.config.spin_interval.min(deadline - now)).await;
        }

        let res = self.create_family_locked(spec).await;
        self.inner.volatile.delete(key).await?;
        res
    }

    async fn create_family_locked(&self, spec: &ExperimentSpec) -> Result<()> {
        let family = spec.instantiate(self.inner.clock.now_millis(), rand::random());
        let mut txn = Transaction::begin(self.inner.store.clone());
        let existing = txn
            .get_multi(family.iter().map(|(experiment, _)| experiment.key()).collect())
            .await?;

        for ((experiment, alternatives), existing) in family.into_iter().zip(existing) {
            if existing.is_some() {
                continue;
            }
            txn.put(experiment.to_record()?);
            for alternative in alternatives {
                txn.put(alternative.to_record()?);
            }
        }

        if txn.is_read_only() {
            tracing::debug!("[bingo]: experiment family {} already exists", spec.name);
        } else {
            txn.commit().await?;
            tracing::info!("[bingo]: created experiment family {}", spec.name);
        }

        self.inner.catalog.refresh(CatalogScope::Live).await?;
        Ok(())
    }

    /// Durable totals of a live experiment plus its in-flight counters.
    pub async fn live_totals(&self, name: &str) -> Result<ExperimentTotals> {
        let Some(record) = self.inner.store.get(Experiment::key_of(name)).await? else {
            return Err(Error::not_found("experiment", name));
        };
        let experiment = Experiment::from_record(&record)?;

        let filter = Filter::all().equals("archived", false).equals("experiment", name);
        let (alternatives, participants, conversions) = futures_util::future::try_join3(
            self.inner.store.scan(Alternative::KIND.to_string(), filter),
            self.inner.counters.read_all(&self.inner.keys.participants(name)),
            self.inner.counters.read_all(&self.inner.keys.conversions(name)),
        )
        .await?;

        let alternatives = alternatives
            .iter()
            .map(Alternative::from_record)
            .map_ok(|alternative| {
                let number = alternative.number as usize;
                AlternativeTotals {
                    number: alternative.number,
                    participants: alternative.participants + participants.get(number).copied().unwrap_or_default(),
                    conversions: alternative.conversions + conversions.get(number).copied().unwrap_or_default(),
                    content: alternative.content,
                    weight: alternative.weight,
                }
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .sorted_by_key(|alternative| alternative.number)
            .collect();

        Ok(ExperimentTotals {
            experiment: experiment.name,
            state: experiment.state,
            alternatives,
        })
    }

    /// Take the persist lock for administrative mutations, waiting up to the mutation budget.
    ///
    /// Lifecycle actions are applied through [`MutationGuard::mutate`].
    pub async fn mutation_guard(&self) -> Result<MutationGuard> {
        MutationGuard::enter(self.clone()).await
    }

    /// Queue a reconciliation run, starting the loop or restarting a broken one.
    ///
    /// A no-op if a run is already queued or running.
    pub fn watchdog(&self) -> Result<SubmitOutcome> {
        let outcome = self.inner.scheduler.submit(persist::reconcile_task(&self.inner))?;
        tracing::debug!("[bingo]: watchdog submitted the reconciliation task, outcome: {outcome:?}");
        Ok(outcome)
    }

    /// Run one reconciliation now, without queueing the next one.
    ///
    /// Returns `None` if another worker holds the persist lock.
    pub async fn persist_now(&self) -> Result<Option<ReconcileReport>> {
        persist::persist_once(&self.inner).await
    }

    /// Write every pending identity bucket to the durable store.
    pub async fn flush_identities(&self) -> Result<usize> {
        self.inner.identities.flush_all().await
    }
}
