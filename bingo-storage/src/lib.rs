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

//! Durable record store capability for bingo.
//!
//! The durable store is the source of truth for experiments, alternatives, identities and the persist lock. It
//! offers batched reads and writes, equality scans over indexed properties and optimistic transactions.

mod entity;
mod memory;
mod record;
mod store;
mod transaction;

pub use entity::Entity;
pub use memory::MemoryDurableStore;
pub use record::{Filter, Record, RecordKey};
pub use store::{Commit, DurableStore, Mutation};
pub use transaction::Transaction;
