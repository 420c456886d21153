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

//! In-memory cache tiers for bingo.
//!
//! - [`RequestMemo`]: the per-request tier, never crosses request boundaries.
//! - [`LocalCache`]: the per-process tier with a short TTL.
//! - [`VolatileCache`]: the capability of the shared, eviction-prone cache service, with [`MemoryVolatileCache`] as
//!   an in-process implementation.

mod local;
mod memo;
mod volatile;

pub use local::{LocalCache, LocalCacheBuilder};
pub use memo::RequestMemo;
pub use volatile::{parse_integer, MemoryVolatileCache, Offset, VolatileCache};
