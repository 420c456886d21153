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

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use bingo_common::error::Result;

use crate::{
    cache::{catalog::CatalogMemo, identity::IdentityHistory},
    engine::BingoInner,
    model::IdentityRecord,
};

/// State of one request: the caller's identity, the request memo of catalog snapshots and the identity history.
///
/// Call [`RequestContext::finish`] at the end of the request to persist participation changes.
#[must_use = "call `finish` to persist participation history"]
pub struct RequestContext {
    inner: Arc<BingoInner>,
    identity: String,
    admin: bool,
    overrides: HashMap<String, u8>,
    catalogs: CatalogMemo,
    history: Option<IdentityHistory>,
}

impl Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("identity", &self.identity)
            .field("admin", &self.admin)
            .field("overrides", &self.overrides)
            .field("history", &self.history)
            .finish()
    }
}

impl RequestContext {
    pub(crate) fn new(inner: Arc<BingoInner>, identity: impl Into<String>) -> Self {
        Self {
            inner,
            identity: identity.into(),
            admin: false,
            overrides: HashMap::new(),
            catalogs: CatalogMemo::new(),
            history: None,
        }
    }

    /// Mark the caller as privileged.
    ///
    /// Default: `false`.
    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    /// Force the alternative of an experiment family for this caller only. Ignored unless the caller is privileged.
    ///
    /// Forced assignments are not counted.
    pub fn with_override(mut self, canonical: impl Into<String>, number: u8) -> Self {
        self.overrides.insert(canonical.into(), number);
        self
    }

    /// The opaque identity of the caller.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns `true` if the caller is privileged.
    pub fn is_admin(&self) -> bool {
        self.admin
    }

    /// The identity history, if loaded by this request.
    pub fn identity_record(&self) -> Option<&IdentityRecord> {
        self.history.as_ref().map(|history| history.record())
    }

    pub(crate) fn forced(&self, canonical: &str) -> Option<u8> {
        if self.admin {
            self.overrides.get(canonical).copied()
        } else {
            None
        }
    }

    pub(crate) fn catalogs(&mut self) -> &mut CatalogMemo {
        &mut self.catalogs
    }

    pub(crate) async fn history(&mut self) -> Result<&mut IdentityHistory> {
        let history = match self.history.take() {
            Some(history) => history,
            None => self.inner.identities.load(&self.identity).await?,
        };
        Ok(self.history.insert(history))
    }

    /// Persist the identity history if this request changed it. Returns `true` if anything was written.
    pub async fn finish(mut self) -> Result<bool> {
        let inner = self.inner.clone();
        match self.history.as_mut() {
            Some(history) => inner.identities.store_if_dirty(history).await,
            None => Ok(false),
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.history.as_ref().is_some_and(|history| history.is_dirty()) {
            tracing::warn!(
                "[request context]: participation history of {} dropped without finish",
                self.identity
            );
        }
    }
}
