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

//! Experiment catalog and participation history data model.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use bingo_common::error::{Error, Result};
use bingo_storage::Entity;
use serde::{Deserialize, Serialize};

/// Max alternatives per experiment, bounded by the fields of one packed counter combination.
pub const MAX_ALTERNATIVES: usize = 4;

/// How conversions of an experiment are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversionKind {
    /// At most one conversion is counted per identity.
    Binary,
    /// Every conversion is counted.
    Counting,
}

/// A conversion event tracked by an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conversion {
    /// Conversion event name.
    pub name: String,
    /// Counting policy.
    pub kind: ConversionKind,
}

impl Conversion {
    /// A conversion counted at most once per identity.
    pub fn binary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ConversionKind::Binary,
        }
    }

    /// A conversion counted on every call.
    pub fn counting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ConversionKind::Counting,
        }
    }
}

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentState {
    /// Users are bucketed and counted.
    Live,
    /// Every user resolves to the short-circuit alternative, nothing is counted.
    Stopped,
    /// Read only, kept for reporting.
    Archived,
}

/// An experiment, one per conversion event of a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    /// Unique name.
    pub name: String,
    /// Name shared by the family, used as the bucketing hash seed.
    pub canonical_name: String,
    /// Tracked conversion.
    pub conversion: Conversion,
    /// Lifecycle state.
    pub state: ExperimentState,
    /// Alternative every user resolves to once stopped.
    pub short_circuit: Option<u8>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Archive time in milliseconds since the Unix epoch.
    pub archived_at: Option<u64>,
    /// Random id of this incarnation, tells apart experiments that reused a name after archive or delete.
    pub instance: u64,
}

impl Experiment {
    /// The bucketing hash seed.
    pub fn hashable_name(&self) -> &str {
        &self.canonical_name
    }

    /// Returns `true` if users are bucketed and counted.
    pub fn is_live(&self) -> bool {
        self.state == ExperimentState::Live
    }

    /// Key of this experiment in identity histories.
    pub fn history_key(&self) -> String {
        format!("{}@{:016x}", self.name, self.instance)
    }
}

impl Entity for Experiment {
    const KIND: &'static str = "Experiment";

    fn name(&self) -> String {
        archived_name(&self.name, self.archived_at)
    }

    fn index(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("archived".to_string(), self.archived_at.is_some().to_string()),
            ("canonical".to_string(), self.canonical_name.clone()),
        ])
    }
}

/// Record name of an experiment, archived experiments move aside so their name can be reused.
pub(crate) fn archived_name(name: &str, archived_at: Option<u64>) -> String {
    match archived_at {
        Some(at) => format!("{name}#archived@{at}"),
        None => name.to_string(),
    }
}

/// A variant of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alternative {
    /// Record name of the owning experiment.
    pub experiment: String,
    /// Ordinal, also the field index in the packed counters.
    pub number: u8,
    /// Payload returned to the caller.
    pub content: String,
    /// Bucketing weight, at least 1.
    pub weight: u32,
    /// Durable participant total as of the last reconciliation.
    pub participants: u64,
    /// Durable conversion total as of the last reconciliation.
    pub conversions: u64,
    /// Whether the owning experiment is archived.
    pub archived: bool,
}

impl Entity for Alternative {
    const KIND: &'static str = "Alternative";

    fn name(&self) -> String {
        alternative_name(&self.experiment, self.number)
    }

    fn index(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("archived".to_string(), self.archived.to_string()),
            ("experiment".to_string(), self.experiment.clone()),
        ])
    }
}

pub(crate) fn alternative_name(experiment: &str, number: u8) -> String {
    format!("{experiment}#{number}")
}

/// One alternative of an [`ExperimentSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternativeSpec {
    /// Payload returned to the caller.
    pub content: String,
    /// Bucketing weight.
    pub weight: u32,
}

/// Declaration of an experiment family, created on first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentSpec {
    /// Canonical name of the family.
    pub name: String,
    /// Alternatives, in ordinal order.
    pub alternatives: Vec<AlternativeSpec>,
    /// Conversions, one experiment is created per conversion.
    pub conversions: Vec<Conversion>,
}

impl ExperimentSpec {
    /// Declare an experiment family without alternatives or conversions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alternatives: vec![],
            conversions: vec![],
        }
    }

    /// Declare a family with equally weighted alternatives and a binary conversion named after the family.
    pub fn binary<I, C>(name: impl Into<String>, alternatives: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let name = name.into();
        let spec = alternatives
            .into_iter()
            .fold(Self::new(name.clone()), |spec, content| spec.with_alternative(content));
        spec.with_conversion(Conversion::binary(name))
    }

    /// Add an alternative with weight 1.
    pub fn with_alternative(self, content: impl Into<String>) -> Self {
        self.with_weighted_alternative(content, 1)
    }

    /// Add an alternative with the given weight.
    pub fn with_weighted_alternative(mut self, content: impl Into<String>, weight: u32) -> Self {
        self.alternatives.push(AlternativeSpec {
            content: content.into(),
            weight,
        });
        self
    }

    /// Add a conversion.
    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversions.push(conversion);
        self
    }

    /// Check the declaration.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("experiment name must not be empty"));
        }
        if self.alternatives.is_empty() || self.alternatives.len() > MAX_ALTERNATIVES {
            return Err(Error::invalid_argument(format!(
                "an experiment needs 1 to {MAX_ALTERNATIVES} alternatives"
            ))
            .with_context("experiment", &self.name)
            .with_context("alternatives", self.alternatives.len()));
        }
        if let Some(alternative) = self.alternatives.iter().find(|alternative| alternative.weight == 0) {
            return Err(Error::invalid_argument("alternative weight must be at least 1")
                .with_context("experiment", &self.name)
                .with_context("alternative", &alternative.content));
        }
        if self.conversions.is_empty() {
            return Err(Error::invalid_argument("an experiment needs at least one conversion")
                .with_context("experiment", &self.name));
        }
        Ok(())
    }

    /// Names of the experiments of the family, in conversion order.
    pub fn experiment_names(&self) -> Vec<String> {
        match self.conversions.as_slice() {
            [_] => vec![self.name.clone()],
            conversions => conversions
                .iter()
                .map(|conversion| format!("{} ({})", self.name, conversion.name))
                .collect(),
        }
    }

    pub(crate) fn instantiate(&self, now: u64, instance: u64) -> Vec<(Experiment, Vec<Alternative>)> {
        self.experiment_names()
            .into_iter()
            .zip(self.conversions.iter())
            .map(|(name, conversion)| {
                let alternatives = self
                    .alternatives
                    .iter()
                    .enumerate()
                    .map(|(number, alternative)| Alternative {
                        experiment: name.clone(),
                        number: number as u8,
                        content: alternative.content.clone(),
                        weight: alternative.weight,
                        participants: 0,
                        conversions: 0,
                        archived: false,
                    })
                    .collect();
                let experiment = Experiment {
                    name,
                    canonical_name: self.name.clone(),
                    conversion: conversion.clone(),
                    state: ExperimentState::Live,
                    short_circuit: None,
                    created_at: now,
                    archived_at: None,
                    instance,
                };
                (experiment, alternatives)
            })
            .collect()
    }
}

/// Administrative lifecycle action, applied to a whole experiment family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationAction {
    /// Stop the experiment and resolve every user to the given alternative.
    ChooseAlternative(u8),
    /// Resume a stopped experiment.
    Resume,
    /// Drain counters into totals and move the experiment to the archive.
    Archive,
    /// Remove the experiment, its alternatives and its counters.
    Delete,
}

impl Display for MutationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationAction::ChooseAlternative(number) => write!(f, "choose_alternative({number})"),
            MutationAction::Resume => write!(f, "resume"),
            MutationAction::Archive => write!(f, "archive"),
            MutationAction::Delete => write!(f, "delete"),
        }
    }
}

/// Participation history of one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// The opaque identity.
    pub identity: String,
    /// History keys of the experiments the identity participates in, see [`Experiment::history_key`].
    pub participating: BTreeSet<String>,
    /// Conversions counted per experiment history key.
    pub conversions: BTreeMap<String, u64>,
}

impl IdentityRecord {
    /// An empty history.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }

    /// Returns `true` if the identity participates in the experiment.
    pub fn is_participating(&self, experiment: &str) -> bool {
        self.participating.contains(experiment)
    }

    /// Conversions counted for the experiment.
    pub fn conversions(&self, experiment: &str) -> u64 {
        self.conversions.get(experiment).copied().unwrap_or_default()
    }

    pub(crate) fn participate(&mut self, experiment: &str) -> bool {
        self.participating.insert(experiment.to_string())
    }

    pub(crate) fn convert(&mut self, experiment: &str) {
        *self.conversions.entry(experiment.to_string()).or_default() += 1;
    }

    /// Fold another snapshot of the same identity into this one.
    ///
    /// Participation is united and the larger conversion count wins, so merging a snapshot twice changes nothing.
    pub fn merge(&mut self, other: IdentityRecord) {
        self.participating.extend(other.participating);
        for (experiment, count) in other.conversions {
            let current = self.conversions.entry(experiment).or_default();
            *current = (*current).max(count);
        }
    }
}

impl Entity for IdentityRecord {
    const KIND: &'static str = "Identity";

    fn name(&self) -> String {
        self.identity.clone()
    }
}

/// Totals of one alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternativeTotals {
    /// Ordinal.
    pub number: u8,
    /// Payload.
    pub content: String,
    /// Bucketing weight.
    pub weight: u32,
    /// Participants, durable plus in flight.
    pub participants: u64,
    /// Conversions, durable plus in flight.
    pub conversions: u64,
}

/// Totals of one experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentTotals {
    /// Experiment name.
    pub experiment: String,
    /// Lifecycle state.
    pub state: ExperimentState,
    /// Alternatives in ordinal order.
    pub alternatives: Vec<AlternativeTotals>,
}

impl ExperimentTotals {
    /// Totals of the alternative with the given ordinal.
    pub fn alternative(&self, number: u8) -> Option<&AlternativeTotals> {
        self.alternatives.iter().find(|alternative| alternative.number == number)
    }

    /// Sum of participants over every alternative.
    pub fn participants(&self) -> u64 {
        self.alternatives.iter().map(|alternative| alternative.participants).sum()
    }

    /// Sum of conversions over every alternative.
    pub fn conversions(&self) -> u64 {
        self.alternatives.iter().map(|alternative| alternative.conversions).sum()
    }
}

#[cfg(test)]
mod tests {
    use bingo_common::error::ErrorKind;

    use super::*;

    #[test]
    fn test_family_names() {
        let spec = ExperimentSpec::binary("gorillas", ["a", "b", "c"]);
        assert_eq!(spec.experiment_names(), vec!["gorillas"]);

        let spec = spec.with_conversion(Conversion::counting("clicks"));
        assert_eq!(spec.experiment_names(), vec!["gorillas (gorillas)", "gorillas (clicks)"]);

        let family = spec.instantiate(42, 7);
        assert_eq!(family.len(), 2);
        for (experiment, alternatives) in family {
            assert_eq!(experiment.hashable_name(), "gorillas");
            assert_eq!(experiment.history_key(), format!("{}@0000000000000007", experiment.name));
            assert_eq!(alternatives.len(), 3);
            assert!(alternatives.iter().all(|alternative| alternative.experiment == experiment.name));
        }
    }

    #[test]
    fn test_validate() {
        assert!(ExperimentSpec::binary("ok", ["a", "b"]).validate().is_ok());

        let cases = [
            ExperimentSpec::binary("", ["a"]),
            ExperimentSpec::binary("empty", Vec::<String>::new()),
            ExperimentSpec::binary("five", ["a", "b", "c", "d", "e"]),
            ExperimentSpec::new("no conversion").with_alternative("a"),
            ExperimentSpec::new("zero")
                .with_weighted_alternative("a", 0)
                .with_conversion(Conversion::binary("zero")),
        ];
        for spec in cases {
            assert_eq!(spec.validate().unwrap_err().kind(), ErrorKind::InvalidArgument, "{spec:?}");
        }
    }

    #[test]
    fn test_archived_record_names() {
        let (mut experiment, alternatives) = ExperimentSpec::binary("gorillas", ["a"]).instantiate(0, 1).remove(0);
        assert_eq!(Entity::name(&experiment), "gorillas");
        assert_eq!(Entity::name(&alternatives[0]), "gorillas#0");

        experiment.archived_at = Some(7);
        assert_eq!(Entity::name(&experiment), "gorillas#archived@7");
        assert_eq!(experiment.index()["archived"], "true");
    }

    #[test]
    fn test_identity_record() {
        let mut record = IdentityRecord::new("user");
        assert!(!record.is_participating("gorillas"));
        assert!(record.participate("gorillas"));
        assert!(!record.participate("gorillas"));
        record.convert("gorillas");
        record.convert("gorillas");
        assert_eq!(record.conversions("gorillas"), 2);
        assert_eq!(record.conversions("monkeys"), 0);
    }

    #[test]
    fn test_merge_identity_records() {
        let mut newer = IdentityRecord::new("user");
        newer.participate("gorillas");
        newer.convert("gorillas");
        newer.convert("gorillas");

        let mut older = IdentityRecord::new("user");
        older.participate("gorillas");
        older.participate("monkeys");
        older.convert("gorillas");
        older.convert("monkeys");

        newer.merge(older.clone());
        assert!(newer.is_participating("monkeys"));
        assert_eq!(newer.conversions("gorillas"), 2);
        assert_eq!(newer.conversions("monkeys"), 1);

        let merged = newer.clone();
        newer.merge(older);
        assert_eq!(newer, merged);
    }

    #[test]
    fn test_reused_name_gets_a_fresh_history_key() {
        let spec = ExperimentSpec::binary("gorillas", ["a", "b"]);
        let (old, _) = spec.instantiate(5, 1).remove(0);
        let (new, _) = spec.instantiate(5, 2).remove(0);
        assert_eq!(old.name, new.name);
        assert_ne!(old.history_key(), new.history_key());

        let mut record = IdentityRecord::new("user");
        record.participate(&old.history_key());
        record.convert(&old.history_key());
        assert!(!record.is_participating(&new.history_key()));
        assert_eq!(record.conversions(&new.history_key()), 0);
    }
}
