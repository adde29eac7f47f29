use std::io;

use thiserror::Error;

/// Structural failures of a read.
///
/// Per-identifier failures never show up here when reading with a pool: they are kept in their [`Outcome`](crate::Outcome).
#[derive(Debug, Error)]
pub enum Error {
    #[error("no identifiers were given")]
    EmptyInput,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to build the async runtime")]
    Runtime(#[source] io::Error),
    #[error("{pending} task(s) did not produce any outcome")]
    Incomplete { pending: usize },
    #[error("tasks do not cover each of the {slots} empty result slots exactly once")]
    TaskMismatch { slots: usize },
}

/// A failed fetch, tagged with the identifier it was attempted for.
#[derive(Debug, Error)]
#[error("failed to fetch `{identifier}`")]
pub struct FetchError {
    identifier: String,
    #[source]
    cause: crate::download::Error,
}

impl FetchError {
    /// Wrap `cause` with the `identifier` it was reported for.
    pub fn new(identifier: impl Into<String>, cause: crate::download::Error) -> Self {
        Self {
            identifier: identifier.into(),
            cause,
        }
    }

    #[inline]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[inline]
    pub fn cause(&self) -> &crate::download::Error {
        &self.cause
    }
}
