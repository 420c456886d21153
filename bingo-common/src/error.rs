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

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// All kinds of [`Error`] raised by bingo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Error raised by an external collaborator (shared cache, durable store, scheduler backend).
    External,
    /// Invalid configuration.
    Config,
    /// Serialization or compression error.
    Codec,
    /// Snapshot checksum mismatch.
    ChecksumMismatch,
    /// Snapshot magic mismatch.
    MagicMismatch,
    /// Argument rejected synchronously, e.g. a negative delta or an out-of-range counter index.
    InvalidArgument,
    /// The requested experiment or record does not exist.
    NotFound,
    /// A durable transaction observed a concurrent write and was not applied.
    TransactionConflict,
    /// The persist lock could not be taken within the spin budget.
    LockTimeout,
    /// A catalog mutation was attempted outside of a mutation guard.
    UnsafeMutation,
    /// Task scheduler error.
    Scheduler,
    /// Closed.
    Closed,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::External => "External error",
            ErrorKind::Config => "Config error",
            ErrorKind::Codec => "Codec error",
            ErrorKind::ChecksumMismatch => "Checksum mismatch",
            ErrorKind::MagicMismatch => "Magic mismatch",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::NotFound => "Not found",
            ErrorKind::TransactionConflict => "Transaction conflict",
            ErrorKind::LockTimeout => "Lock timeout",
            ErrorKind::UnsafeMutation => "Unsafe mutation",
            ErrorKind::Scheduler => "Scheduler error",
            ErrorKind::Closed => "Closed",
        }
    }
}

/// Error is the error struct returned by all bingo functions.
///
/// ## Display
///
/// - Via `Display`, e.g. `err.to_string()`, the error is printed in a single line:
///
/// ```shell
/// Lock timeout, context: { budget: 20s } => persist lock is held by another worker
/// ```
///
/// - Via `Debug`, e.g. `format!("{err:?}")`, the error is printed in multiple lines with its context, source and
///   backtrace (if captured).
///
/// - Via `{:#?}`, the conventional struct-style representation is printed.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {k}: {v}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            let context = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, ", context: {{ {context} }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

/// Cloning an [`Error`] clones its message and context, the source and backtrace are shared.
impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// ```rust
    /// # use bingo_common::error::{Error, ErrorKind};
    /// let err = Error::new(ErrorKind::External, "shared cache unavailable")
    ///     .with_context("key", "bingo:catalog")
    ///     .with_source(std::io::Error::other("connection reset"));
    /// assert_eq!(err.kind(), ErrorKind::External);
    /// ```
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// Setting the source twice is a bug and raises a panic in debug builds.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Result type for bingo.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::Codec`] error from [`bincode::Error`].
    pub fn bincode_error(source: bincode::Error) -> Self {
        match *source {
            bincode::ErrorKind::Io(e) => Error::new(ErrorKind::Codec, "coding error").with_source(e),
            _ => Error::new(ErrorKind::Codec, "coding error").with_source(source),
        }
    }

    /// Helper for creating an [`ErrorKind::InvalidArgument`] error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    /// Helper for creating an [`ErrorKind::NotFound`] error for the given name.
    pub fn not_found(what: &'static str, name: impl ToString) -> Self {
        Error::new(ErrorKind::NotFound, format!("{what} does not exist")).with_context("name", name)
    }

    /// Helper for creating an [`ErrorKind::TransactionConflict`] error.
    pub fn conflict(kind: impl ToString, name: impl ToString) -> Self {
        Error::new(ErrorKind::TransactionConflict, "record changed since it was read")
            .with_context("kind", kind)
            .with_context("name", name)
    }

    /// Helper for creating an [`ErrorKind::LockTimeout`] error.
    pub fn lock_timeout(budget: std::time::Duration) -> Self {
        Error::new(ErrorKind::LockTimeout, "persist lock is held by another worker")
            .with_context("budget", format!("{budget:?}"))
    }

    /// Helper for creating an [`ErrorKind::UnsafeMutation`] error.
    pub fn unsafe_mutation(action: impl ToString, experiment: impl ToString) -> Self {
        Error::new(ErrorKind::UnsafeMutation, "catalog mutations must run inside a mutation guard")
            .with_context("action", action)
            .with_context("experiment", experiment)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::bincode_error(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Codec, "coding error").with_source(e)
    }
}
