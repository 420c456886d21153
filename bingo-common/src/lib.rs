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

//! Shared components for bingo: the error type, the snapshot codec, stable hashing and clocks.

/// Wall-clock sources.
pub mod clock;
/// Snapshot codec.
pub mod code;
/// Error type.
pub mod error;
/// Stable hashing for bucketing.
pub mod hasher;
