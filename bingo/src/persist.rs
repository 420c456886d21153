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

//! Reconciliation loop: drains in-flight counters into durable totals under the persist lock.
//!
//! A run takes the persist lock, folds every live experiment's counters into its alternatives' totals, rewrites the
//! catalog tiers, sweeps the identity buckets and releases the lock. In production a successful run queues the
//! next one under a fixed task id, so a duplicate submission from the watchdog is a no-op.

use std::sync::{Arc, Weak};

use bingo_common::error::Result;
use bingo_storage::Entity;
use itertools::Itertools;

use crate::{
    builder::Environment,
    cache::catalog::CatalogScope,
    engine::BingoInner,
    model::MAX_ALTERNATIVES,
    scheduler::Task,
};

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live experiments visited.
    pub experiments: usize,
    /// Participants folded into durable totals.
    pub participants: u64,
    /// Conversions folded into durable totals.
    pub conversions: u64,
    /// Identity records written to the durable store.
    pub identities: usize,
}

pub(crate) async fn reconcile(inner: &BingoInner) -> Result<ReconcileReport> {
    // The durable store is the source of truth while the lock is held.
    let catalog = Arc::new(inner.catalog.load(CatalogScope::Live).await?);

    let names = catalog.entries().map(|entry| entry.experiment.name.clone()).collect_vec();
    let keys = names
        .iter()
        .flat_map(|name| [inner.keys.participants(name), inner.keys.conversions(name)])
        .collect_vec();
    let records = catalog
        .entries()
        .map(|entry| entry.experiment.to_record())
        .collect::<Result<Vec<_>>>()?;

    let ((), popped) =
        futures_util::future::try_join(inner.store.put_multi(records), inner.counters.pop_all(keys)).await?;

    let mut report = ReconcileReport {
        experiments: names.len(),
        ..Default::default()
    };
    let mut txn = catalog.begin();
    for (name, drained) in names.iter().zip(popped.chunks(2)) {
        let [participants, conversions] = drained else {
            continue;
        };
        for number in 0..MAX_ALTERNATIVES {
            let (p, c) = (participants[number], conversions[number]);
            if p == 0 && c == 0 {
                continue;
            }
            if !txn.add_totals(name, number as u8, p, c) {
                tracing::warn!(
                    "[reconciler]: drop {p} participants and {c} conversions of unknown alternative {number} of {name}"
                );
                continue;
            }
            report.participants += p;
            report.conversions += c;
        }
    }

    let dirty = txn.is_dirty();
    let catalog = inner.catalog.commit(txn).await?;
    if !dirty {
        inner.catalog.publish(CatalogScope::Live, catalog).await?;
    }

    report.identities = inner.identities.flush_all().await?;
    Ok(report)
}

/// Run one reconciliation if the persist lock is free. Returns `None` if another worker holds it.
pub(crate) async fn persist_once(inner: &BingoInner) -> Result<Option<ReconcileReport>> {
    if !inner.lock.take(inner.config.lock_timeout).await? {
        tracing::info!("[reconciler]: persist lock is held by another worker, skip this run");
        return Ok(None);
    }

    let res = reconcile(inner).await;
    let released = inner.lock.release().await;
    let report = res?;
    released?;

    tracing::debug!(
        "[reconciler]: reconciled {} experiments, participants: {}, conversions: {}, identities: {}",
        report.experiments,
        report.participants,
        report.conversions,
        report.identities
    );
    Ok(Some(report))
}

async fn run_chained(inner: Weak<BingoInner>) -> Result<()> {
    let Some(inner) = inner.upgrade() else {
        tracing::debug!("[reconciler]: engine dropped, stop the loop");
        return Ok(());
    };
    if persist_once(&inner).await?.is_none() {
        return Ok(());
    }
    if inner.config.environment == Environment::Production {
        let task = reconcile_task(&inner).with_delay(inner.config.persist_interval);
        inner.scheduler.submit(task)?;
    }
    Ok(())
}

/// The reconciliation task, always under the same task id.
pub(crate) fn reconcile_task(inner: &Arc<BingoInner>) -> Task {
    let weak = Arc::downgrade(inner);
    Task::new(inner.keys.reconcile_task(), move || run_chained(weak.clone()))
}
