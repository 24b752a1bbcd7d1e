//! Coalescer error types.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A failure reported by a [`Fetcher`](crate::Fetcher).
///
/// One backend failure may have to be delivered to every key of a batch, so
/// the underlying error is reference counted and the wrapper is cheap to clone.
#[derive(Clone)]
pub struct FetchError {
    inner: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl FetchError {
    /// Wraps a backend error.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            inner: Arc::from(error.into()),
        }
    }

    /// Creates a fetch error from a plain message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::new(message.to_string())
    }

    /// Returns the wrapped backend error.
    pub fn get_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.inner
    }

    /// Returns true if both handles point at the same backend failure.
    pub fn ptr_eq(&self, other: &FetchError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FetchError").field(&self.inner).finish()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// Errors observed by a caller awaiting a [`Completion`](crate::Completion).
#[derive(Debug, Clone, Error)]
pub enum CoalesceError {
    /// The backend fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A single-key fetch found nothing and the coalescer is configured
    /// with [`MissingKeyPolicy::Reject`](crate::MissingKeyPolicy::Reject).
    #[error("no value found for requested key")]
    NotFound,

    /// The request was dropped without being settled.
    #[error("request abandoned before completion")]
    Abandoned,
}

impl CoalesceError {
    /// Returns the backend failure, if this error carries one.
    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            CoalesceError::Fetch(e) => Some(e),
            _ => None,
        }
    }
}
