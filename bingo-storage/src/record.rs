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

use std::{collections::BTreeMap, fmt::Display};

use bytes::Bytes;

/// Identity of a durable record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    /// Entity kind, e.g. `Experiment`.
    pub kind: String,
    /// Unique name within the kind.
    pub name: String,
}

impl RecordKey {
    /// Create a record key.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A durable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record identity.
    pub key: RecordKey,
    /// Version assigned by the store on every write. `0` for records that have never been written.
    pub version: u64,
    /// Indexed properties, used by equality scans.
    pub index: BTreeMap<String, String>,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Record {
    /// Create a record that has never been written.
    pub fn new(key: RecordKey, index: BTreeMap<String, String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            version: 0,
            index,
            payload: payload.into(),
        }
    }
}

/// Conjunction of equality filters over indexed properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<(String, String)>,
}

impl Filter {
    /// A filter that matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Require the indexed property `name` to equal `value`.
    pub fn equals(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.conditions.push((name.into(), value.to_string()));
        self
    }

    /// Check if the record matches the filter.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(name, value)| record.index.get(name) == Some(value))
    }
}
