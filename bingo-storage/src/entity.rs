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

use std::collections::BTreeMap;

use bingo_common::error::{Error, ErrorKind, Result};
use serde::{de::DeserializeOwned, Serialize};

use crate::record::{Record, RecordKey};

/// A typed value persisted as a [`Record`] with a bincode payload.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Record kind of the entity.
    const KIND: &'static str;

    /// Unique name of the entity within its kind.
    fn name(&self) -> String;

    /// Indexed properties used by equality scans.
    fn index(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Key of the entity with the given name.
    fn key_of(name: &str) -> RecordKey {
        RecordKey::new(Self::KIND, name)
    }

    /// Key of the entity.
    fn key(&self) -> RecordKey {
        Self::key_of(&self.name())
    }

    /// Encode the entity.
    fn to_record(&self) -> Result<Record> {
        let payload = bincode::serialize(self)?;
        Ok(Record::new(self.key(), self.index(), payload))
    }

    /// Decode the entity.
    fn from_record(record: &Record) -> Result<Self> {
        if record.key.kind != Self::KIND {
            return Err(Error::new(ErrorKind::Codec, "record kind mismatch")
                .with_context("expected", Self::KIND)
                .with_context("actual", &record.key.kind));
        }
        Ok(bincode::deserialize(&record.payload)?)
    }
}
