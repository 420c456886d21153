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

//! Split testing engine: deterministic bucketing of identities into experiment alternatives, participation and
//! conversion counters packed into a volatile shared cache, and a reconciliation loop that drains them into durable
//! totals.
//!
//! ```no_run
//! use bingo::{BingoBuilder, ExperimentSpec};
//!
//! # async fn example() -> bingo::Result<()> {
//! let bingo = BingoBuilder::new().build()?;
//! bingo.watchdog()?;
//!
//! let mut ctx = bingo.context("user-42");
//! let spec = ExperimentSpec::binary("gorillas", ["a", "b", "c"]);
//! let content = bingo.ab_test(&mut ctx, &spec).await?;
//! bingo.record_conversion(&mut ctx, &["gorillas"]).await?;
//! ctx.finish().await?;
//! # let _ = content;
//! # Ok(())
//! # }
//! ```

mod builder;
mod cache;
mod context;
mod counter;
mod engine;
mod guard;
mod lock;
mod model;
mod persist;
mod scheduler;
mod selector;

mod prelude;
pub use prelude::*;
