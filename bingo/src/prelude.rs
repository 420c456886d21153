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

pub use bingo_common::{
    clock::{Clock, ManualClock, SystemClock},
    code::Compression,
    error::{Error, ErrorKind, Result},
};
pub use bingo_memory::{MemoryVolatileCache, Offset, VolatileCache};
pub use bingo_storage::{DurableStore, Entity, Filter, MemoryDurableStore, Record, RecordKey};

pub use crate::{
    builder::{BingoBuilder, Environment},
    cache::{
        catalog::{Catalog, CatalogEntry, CatalogScope, CatalogTxn},
        identity::IdentityHistory,
    },
    context::RequestContext,
    counter::PackedCounterSet,
    engine::Bingo,
    guard::MutationGuard,
    lock::PersistLock,
    model::{
        Alternative, AlternativeSpec, AlternativeTotals, Conversion, ConversionKind, Experiment, ExperimentSpec,
        ExperimentState, ExperimentTotals, IdentityRecord, MutationAction, MAX_ALTERNATIVES,
    },
    persist::ReconcileReport,
    scheduler::{RetryPolicy, SubmitOutcome, Task, TaskScheduler, TokioScheduler},
    selector::select,
};
