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

//! Tests of administrative mutations and the reconciliation loop.

use std::{sync::Arc, time::Duration};

use bingo::{
    Bingo, BingoBuilder, CatalogScope, Environment, ErrorKind, ExperimentSpec, ExperimentState, ManualClock,
    MemoryDurableStore, MemoryVolatileCache, MutationAction, SubmitOutcome,
};

fn builder(store: &MemoryDurableStore) -> BingoBuilder {
    BingoBuilder::new()
        .with_volatile_cache(Arc::new(MemoryVolatileCache::new()))
        .with_durable_store(Arc::new(store.clone()))
        .with_environment(Environment::Development)
        .with_spin_interval(Duration::from_millis(5))
        .with_mutation_budget(Duration::from_secs(5))
}

fn gorillas() -> ExperimentSpec {
    ExperimentSpec::binary("gorillas", ["a", "b", "c"])
}

async fn participate(bingo: &Bingo, identities: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut contents = vec![];
    for identity in identities {
        let mut ctx = bingo.context(identity);
        contents.push(bingo.ab_test(&mut ctx, &gorillas()).await.unwrap());
        ctx.finish().await.unwrap();
    }
    contents
}

fn identities(range: std::ops::Range<usize>) -> impl Iterator<Item = String> {
    range.map(|i| format!("identity-{i}"))
}

#[test_log::test(tokio::test)]
async fn test_mutation_requires_a_live_hold() {
    let store = MemoryDurableStore::new();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let bingo = builder(&store)
        .with_clock(clock.clone())
        .with_lock_timeout(Duration::from_secs(10))
        .with_mutation_budget(Duration::from_millis(50))
        .build()
        .unwrap();
    participate(&bingo, identities(0..1)).await;

    let guard = bingo.mutation_guard().await.unwrap();
    // Other handles of the same engine cannot enter while the guard holds the lock.
    let other = bingo.clone();
    let err = tokio::spawn(async move { other.mutation_guard().await.map(|_| ()) })
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);

    // The hold expires and the reconciliation loop takes the lock over.
    clock.advance(Duration::from_secs(11));
    assert!(bingo.persist_lock().take(Duration::from_secs(10)).await.unwrap());
    let err = guard
        .mutate("gorillas", MutationAction::ChooseAlternative(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsafeMutation);

    // Exiting leaves the new holder alone.
    guard.exit().await.unwrap();
    assert!(bingo.persist_lock().is_held().await.unwrap());
    assert_eq!(bingo.live_totals("gorillas").await.unwrap().state, ExperimentState::Live);
}

#[test_log::test(tokio::test)]
async fn test_choose_alternative_waits_for_the_lock() {
    let store = MemoryDurableStore::new();
    let bingo = builder(&store).build().unwrap();
    let before = participate(&bingo, identities(0..30)).await;
    assert!(before.iter().any(|content| content != "b"));

    // Another worker is reconciling.
    assert!(bingo.persist_lock().take(Duration::from_secs(60)).await.unwrap());
    let lock = bingo.persist_lock().clone();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        lock.release().await.unwrap();
    });

    let guard = bingo.mutation_guard().await.unwrap();
    guard.mutate("gorillas", MutationAction::ChooseAlternative(1)).await.unwrap();
    guard.exit().await.unwrap();
    releaser.await.unwrap();

    let after = participate(&bingo, identities(0..30).chain(identities(100..130))).await;
    assert!(after.iter().all(|content| content == "b"));

    // Stopped experiments count nobody new.
    let totals = bingo.live_totals("gorillas").await.unwrap();
    assert_eq!(totals.state, ExperimentState::Stopped);
    assert_eq!(totals.participants(), 30);
}

#[test_log::test(tokio::test)]
async fn test_mutation_guard_times_out() {
    let store = MemoryDurableStore::new();
    let bingo = builder(&store)
        .with_mutation_budget(Duration::from_millis(50))
        .build()
        .unwrap();
    participate(&bingo, identities(0..1)).await;

    assert!(bingo.persist_lock().take(Duration::from_secs(60)).await.unwrap());
    let err = bingo.mutation_guard().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);

    // Nothing changed.
    let totals = bingo.live_totals("gorillas").await.unwrap();
    assert_eq!(totals.state, ExperimentState::Live);
}

#[test_log::test(tokio::test)]
async fn test_choose_unknown_alternative() {
    let store = MemoryDurableStore::new();
    let bingo = builder(&store).build().unwrap();
    participate(&bingo, identities(0..1)).await;

    let guard = bingo.mutation_guard().await.unwrap();
    let err = guard
        .mutate("gorillas", MutationAction::ChooseAlternative(3))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = guard.mutate("missing", MutationAction::Archive).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    guard.exit().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_resume() {
    let store = MemoryDurableStore::new();
    let bingo = builder(&store).build().unwrap();
    let before = participate(&bingo, identities(0..20)).await;

    let guard = bingo.mutation_guard().await.unwrap();
    guard.mutate("gorillas", MutationAction::ChooseAlternative(0)).await.unwrap();
    guard.mutate("gorillas", MutationAction::Resume).await.unwrap();
    guard.exit().await.unwrap();

    // Bucketing is deterministic, returning identities keep their alternative.
    assert_eq!(participate(&bingo, identities(0..20)).await, before);
    participate(&bingo, identities(20..25)).await;
    let totals = bingo.live_totals("gorillas").await.unwrap();
    assert_eq!(totals.state, ExperimentState::Live);
    assert_eq!(totals.participants(), 25);
}

#[test_log::test(tokio::test)]
async fn test_archive_frees_the_name() {
    let store = MemoryDurableStore::new();
    let bingo = builder(&store).build().unwrap();
    participate(&bingo, identities(0..10)).await;
    bingo.persist_now().await.unwrap();
    participate(&bingo, identities(10..15)).await;

    let guard = bingo.mutation_guard().await.unwrap();
    guard.mutate("gorillas", MutationAction::Archive).await.unwrap();
    guard.exit().await.unwrap();

    // Durable and in-flight counts both land in the archived totals.
    let mut ctx = bingo.context("admin");
    let archived = bingo.catalog(&mut ctx, CatalogScope::Archived).await.unwrap();
    assert_eq!(archived.len(), 1);
    let entry = archived.entries().next().unwrap();
    assert_eq!(entry.experiment.name, "gorillas");
    assert_eq!(entry.experiment.state, ExperimentState::Archived);
    assert!(entry.experiment.archived_at.is_some());
    assert_eq!(
        entry
            .alternatives
            .iter()
            .map(|alternative| alternative.participants)
            .sum::<u64>(),
        15
    );
    let live = bingo.catalog(&mut ctx, CatalogScope::Live).await.unwrap();
    assert!(live.get("gorillas").is_none());
    ctx.finish().await.unwrap();

    // The name starts over.
    participate(&bingo, identities(100..103)).await;
    assert_eq!(bingo.live_totals("gorillas").await.unwrap().participants(), 3);
    assert_eq!(store.count("Experiment"), 2);
}

#[test_log::test(tokio::test)]
async fn test_delete() {
    let store = MemoryDurableStore::new();
    let bingo = builder(&store).build().unwrap();
    participate(&bingo, identities(0..5)).await;

    let guard = bingo.mutation_guard().await.unwrap();
    guard.mutate("gorillas", MutationAction::Delete).await.unwrap();
    guard.exit().await.unwrap();

    assert_eq!(store.count("Experiment"), 0);
    assert_eq!(store.count("Alternative"), 0);
    let mut ctx = bingo.context("identity-0");
    assert_eq!(bingo.assign(&mut ctx, "gorillas").await.unwrap_err().kind(), ErrorKind::NotFound);
    ctx.finish().await.unwrap();
    assert_eq!(bingo.live_totals("gorillas").await.unwrap_err().kind(), ErrorKind::NotFound);
}

async fn convert(bingo: &Bingo, identities: impl IntoIterator<Item = String>) -> usize {
    let mut recorded = 0;
    for identity in identities {
        let mut ctx = bingo.context(identity);
        recorded += bingo.record_conversion(&mut ctx, &["gorillas"]).await.unwrap();
        ctx.finish().await.unwrap();
    }
    recorded
}

#[test_log::test(tokio::test)]
async fn test_returning_identities_join_a_reused_name() {
    for action in [MutationAction::Archive, MutationAction::Delete] {
        let store = MemoryDurableStore::new();
        let bingo = builder(&store).build().unwrap();
        participate(&bingo, identities(0..3)).await;
        assert_eq!(convert(&bingo, identities(0..3)).await, 3);
        bingo.persist_now().await.unwrap();

        let guard = bingo.mutation_guard().await.unwrap();
        guard.mutate("gorillas", action).await.unwrap();
        guard.exit().await.unwrap();

        // The same identities come back to a new experiment under the old name.
        participate(&bingo, identities(0..3)).await;
        let totals = bingo.live_totals("gorillas").await.unwrap();
        assert_eq!(totals.participants(), 3, "{action:?}");

        assert_eq!(convert(&bingo, identities(0..3)).await, 3, "{action:?}");
        // Binary conversions still count once.
        assert_eq!(convert(&bingo, identities(0..3)).await, 0, "{action:?}");
        let totals = bingo.live_totals("gorillas").await.unwrap();
        assert_eq!(totals.participants(), 3, "{action:?}");
        assert_eq!(totals.conversions(), 3, "{action:?}");
    }
}

#[test_log::test(tokio::test)]
async fn test_dropped_guard_releases_the_lock() {
    let store = MemoryDurableStore::new();
    let bingo = builder(&store).build().unwrap();

    let guard = bingo.mutation_guard().await.unwrap();
    assert!(bingo.persist_lock().is_held().await.unwrap());
    drop(guard);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!bingo.persist_lock().is_held().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_reconciliation_loop() {
    let store = MemoryDurableStore::new();
    let bingo = builder(&store)
        .with_environment(Environment::Production)
        .with_persist_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    assert_eq!(bingo.watchdog().unwrap(), SubmitOutcome::Queued);
    assert_eq!(bingo.watchdog().unwrap(), SubmitOutcome::AlreadyQueued);

    participate(&bingo, identities(0..40)).await;

    // The loop keeps draining on its own.
    let mut drained = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if store.count("Identity") == 40 {
            drained = true;
            break;
        }
    }
    assert!(drained);
    let totals = bingo.live_totals("gorillas").await.unwrap();
    assert_eq!(totals.participants(), 40);
}
