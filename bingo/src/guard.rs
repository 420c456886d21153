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

//! Administrative lifecycle mutations, serialized against the reconciliation loop.

use bingo_common::error::{Error, Result};
use bingo_storage::{Entity, Filter, Transaction};
use itertools::Itertools;

use crate::{
    cache::catalog::CatalogScope,
    engine::{Bingo, BingoInner},
    model::{
        alternative_name, archived_name, Alternative, Experiment, ExperimentState, MutationAction, MAX_ALTERNATIVES,
    },
};

/// Scope holding the persist lock for administrative mutations.
///
/// Lifecycle mutations are only reachable through [`MutationGuard::mutate`], and fail with
/// [`bingo_common::error::ErrorKind::UnsafeMutation`] once the hold of the guard expired or was taken over.
/// [`MutationGuard::exit`] refreshes the catalog tiers and releases the lock; a guard dropped without exiting
/// releases the lock in the background.
#[derive(Debug)]
#[must_use = "the persist lock is held until the guard exits"]
pub struct MutationGuard {
    bingo: Bingo,
    stamp: u64,
    exited: bool,
}

impl MutationGuard {
    pub(crate) async fn enter(bingo: Bingo) -> Result<Self> {
        let inner = bingo.inner();
        let stamp = inner
            .lock
            .spin_and_take(inner.config.mutation_budget, inner.config.lock_timeout)
            .await?;
        tracing::debug!("[mutation guard]: entered, hold expires at {stamp}");
        Ok(Self {
            bingo,
            stamp,
            exited: false,
        })
    }

    /// Apply a lifecycle action to the experiment family of `name`.
    pub async fn mutate(&self, name: &str, action: MutationAction) -> Result<()> {
        let inner = self.bingo.inner();
        if !inner.lock.is_held_by(self.stamp).await? {
            tracing::warn!("[mutation guard]: hold {} is lost, refuse {action} on {name}", self.stamp);
            return Err(Error::unsafe_mutation(action, name));
        }
        apply(inner, name, action).await
    }

    /// Refresh the catalog tiers and release the persist lock.
    pub async fn exit(mut self) -> Result<()> {
        self.exited = true;
        let inner = self.bingo.inner();

        let refreshed = futures_util::future::try_join(
            inner.catalog.refresh(CatalogScope::Live),
            inner.catalog.refresh(CatalogScope::Archived),
        )
        .await;
        let released = inner.lock.release_held(self.stamp).await;
        tracing::debug!("[mutation guard]: exited");
        refreshed?;
        released.map(|_| ())
    }
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        let inner = self.bingo.inner();
        tracing::warn!("[mutation guard]: dropped without exit, release the persist lock in the background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let lock = inner.lock.clone();
                let stamp = self.stamp;
                handle.spawn(async move {
                    if let Err(e) = lock.release_held(stamp).await {
                        tracing::warn!("[mutation guard]: failed to release the persist lock, error: {e}");
                    }
                });
            }
            Err(_) => tracing::warn!("[mutation guard]: no runtime to release the persist lock, wait for its expiry"),
        }
    }
}

/// Records of one experiment of a family, read through a transaction.
struct FamilyMember {
    experiment: Experiment,
    alternatives: Vec<Alternative>,
}

async fn read_family(inner: &BingoInner, txn: &mut Transaction, name: &str) -> Result<Vec<FamilyMember>> {
    let canonical = match txn.get(Experiment::key_of(name)).await? {
        Some(record) => Experiment::from_record(&record)?.canonical_name,
        None => name.to_string(),
    };

    let filter = Filter::all().equals("archived", false).equals("canonical", &canonical);
    let scanned = inner.store.scan(Experiment::KIND.to_string(), filter).await?;
    if scanned.is_empty() {
        return Err(Error::not_found("experiment", name));
    }

    let experiments = txn
        .get_multi(scanned.iter().map(|record| record.key.clone()).collect())
        .await?
        .into_iter()
        .flatten()
        .map(|record| Experiment::from_record(&record))
        .collect::<Result<Vec<_>>>()?;

    let mut family = Vec::with_capacity(experiments.len());
    for experiment in experiments {
        let keys = (0..MAX_ALTERNATIVES as u8)
            .map(|number| Alternative::key_of(&alternative_name(&experiment.name, number)))
            .collect_vec();
        let alternatives = txn
            .get_multi(keys)
            .await?
            .into_iter()
            .flatten()
            .map(|record| Alternative::from_record(&record))
            .collect::<Result<Vec<_>>>()?;
        family.push(FamilyMember {
            experiment,
            alternatives,
        });
    }
    Ok(family)
}

async fn apply(inner: &BingoInner, name: &str, action: MutationAction) -> Result<()> {
    let mut txn = Transaction::begin(inner.store.clone());
    let family = read_family(inner, &mut txn, name).await?;
    let counter_keys = family
        .iter()
        .flat_map(|member| {
            [
                inner.keys.participants(&member.experiment.name),
                inner.keys.conversions(&member.experiment.name),
            ]
        })
        .collect_vec();

    match action {
        MutationAction::ChooseAlternative(number) => {
            for mut member in family {
                if !member.alternatives.iter().any(|alternative| alternative.number == number) {
                    return Err(Error::invalid_argument("no such alternative")
                        .with_context("experiment", &member.experiment.name)
                        .with_context("alternative", number));
                }
                member.experiment.state = ExperimentState::Stopped;
                member.experiment.short_circuit = Some(number);
                txn.put(member.experiment.to_record()?);
            }
            txn.commit().await?;
        }
        MutationAction::Resume => {
            for mut member in family {
                member.experiment.state = ExperimentState::Live;
                member.experiment.short_circuit = None;
                txn.put(member.experiment.to_record()?);
            }
            txn.commit().await?;
        }
        MutationAction::Archive => {
            // In-flight counts join the archived totals, then the combinations go.
            let now = inner.clock.now_millis();
            for member in family {
                let FamilyMember {
                    mut experiment,
                    alternatives,
                } = member;
                let (participants, conversions) = futures_util::future::try_join(
                    inner.counters.read_all(&inner.keys.participants(&experiment.name)),
                    inner.counters.read_all(&inner.keys.conversions(&experiment.name)),
                )
                .await?;

                txn.delete(experiment.key());
                experiment.state = ExperimentState::Archived;
                experiment.archived_at = Some(now);
                let archived = archived_name(&experiment.name, experiment.archived_at);
                for mut alternative in alternatives {
                    txn.delete(alternative.key());
                    let number = alternative.number as usize;
                    alternative.participants += participants.get(number).copied().unwrap_or_default();
                    alternative.conversions += conversions.get(number).copied().unwrap_or_default();
                    alternative.experiment = archived.clone();
                    alternative.archived = true;
                    txn.put(alternative.to_record()?);
                }
                txn.put(experiment.to_record()?);
            }
            txn.commit().await?;
            inner.counters.delete(counter_keys).await?;
            inner.catalog.refresh(CatalogScope::Archived).await?;
        }
        MutationAction::Delete => {
            for member in family {
                txn.delete(member.experiment.key());
                for alternative in member.alternatives {
                    txn.delete(alternative.key());
                }
            }
            txn.commit().await?;
            inner.counters.delete(counter_keys).await?;
        }
    }

    inner.catalog.refresh(CatalogScope::Live).await?;
    tracing::info!("[mutation guard]: applied {action} to {name}");
    Ok(())
}
