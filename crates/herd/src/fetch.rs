//! Backend fetch capabilities consumed by the coalescer.
//!
//! A [`Fetcher`] exposes two lookups: one key at a time, or many keys in a
//! single bulk call. The coalescer picks between them based on how many
//! distinct keys accumulated since the previous flush started.

use crate::FetchError;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A value that carries the key it was fetched for.
///
/// Bulk fetches may return results in any order, so results are routed back
/// to their requesters through this identifier. Returning `None` marks the
/// result as malformed; it is discarded and resolves no request.
pub trait Keyed<K> {
    /// Returns the identifier of this value.
    fn key(&self) -> Option<&K>;
}

impl<K, T: Keyed<K>> Keyed<K> for Arc<T> {
    fn key(&self) -> Option<&K> {
        (**self).key()
    }
}

/// Single-key and multi-key lookup functions supplied by the host.
#[async_trait]
pub trait Fetcher<K, V>: Send + Sync + 'static {
    /// Fetches one key.
    ///
    /// `Ok(None)` means the key does not exist. How that is reported to the
    /// caller depends on the coalescer's [`MissingKeyPolicy`](crate::MissingKeyPolicy).
    async fn fetch_one(&self, key: &K) -> Result<Option<V>, FetchError>;

    /// Fetches several keys at once.
    ///
    /// Results may come back in any order. Keys that do not exist may be
    /// omitted entirely or reported as `None` at any position.
    async fn fetch_many(&self, keys: &[K]) -> Result<Vec<Option<V>>, FetchError>;
}

#[async_trait]
impl<K, V, T> Fetcher<K, V> for Arc<T>
where
    K: Send + Sync + 'static,
    V: Send + 'static,
    T: Fetcher<K, V> + ?Sized,
{
    async fn fetch_one(&self, key: &K) -> Result<Option<V>, FetchError> {
        (**self).fetch_one(key).await
    }

    async fn fetch_many(&self, keys: &[K]) -> Result<Vec<Option<V>>, FetchError> {
        (**self).fetch_many(keys).await
    }
}

/// A [`Fetcher`] built from two async closures.
///
/// ```rust,no_run
/// use herd::{FetchError, FnFetcher};
///
/// let fetcher = FnFetcher::<u64, (u64, u64), _, _>::new(
///     |key: u64| async move { Ok::<_, FetchError>(Some((key, key * 2))) },
///     |keys: Vec<u64>| async move {
///         Ok::<_, FetchError>(keys.into_iter().map(|k| Some((k, k * 2))).collect::<Vec<_>>())
///     },
/// );
/// # let _ = fetcher;
/// ```
pub struct FnFetcher<K, V, One, Many> {
    one: One,
    many: Many,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V, One, Many> FnFetcher<K, V, One, Many> {
    /// Creates a fetcher from a single-key and a multi-key function.
    pub fn new(one: One, many: Many) -> Self {
        Self {
            one,
            many,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K, V, One, OneFut, Many, ManyFut> Fetcher<K, V> for FnFetcher<K, V, One, Many>
where
    K: Clone + Send + Sync + 'static,
    V: Send + 'static,
    One: Fn(K) -> OneFut + Send + Sync + 'static,
    OneFut: Future<Output = Result<Option<V>, FetchError>> + Send,
    Many: Fn(Vec<K>) -> ManyFut + Send + Sync + 'static,
    ManyFut: Future<Output = Result<Vec<Option<V>>, FetchError>> + Send,
{
    async fn fetch_one(&self, key: &K) -> Result<Option<V>, FetchError> {
        (self.one)(key.clone()).await
    }

    async fn fetch_many(&self, keys: &[K]) -> Result<Vec<Option<V>>, FetchError> {
        (self.many)(keys.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: Option<String>,
    }

    impl Keyed<String> for Row {
        fn key(&self) -> Option<&String> {
            self.id.as_ref()
        }
    }

    #[test]
    fn test_keyed_through_arc() {
        let row = Arc::new(Row {
            id: Some("a".to_string()),
        });
        assert_eq!(row.key(), Some(&"a".to_string()));

        let malformed = Row { id: None };
        assert!(malformed.key().is_none());
    }

    #[tokio::test]
    async fn test_fn_fetcher_dispatches_to_closures() {
        let fetcher = FnFetcher::<u32, u32, _, _>::new(
            |key: u32| async move { Ok::<_, FetchError>(Some(key + 1)) },
            |keys: Vec<u32>| async move {
                Ok::<_, FetchError>(keys.into_iter().map(|k| Some(k * 10)).collect())
            },
        );

        assert_eq!(fetcher.fetch_one(&1).await.unwrap(), Some(2));
        assert_eq!(
            fetcher.fetch_many(&[1, 2]).await.unwrap(),
            vec![Some(10), Some(20)]
        );
    }

    #[tokio::test]
    async fn test_arc_fetcher_delegates() {
        let fetcher: Arc<dyn Fetcher<u32, u32>> = Arc::new(FnFetcher::<u32, u32, _, _>::new(
            |_key: u32| async { Err::<Option<u32>, _>(FetchError::msg("down")) },
            |_keys: Vec<u32>| async { Ok::<Vec<Option<u32>>, FetchError>(Vec::new()) },
        ));

        let err = fetcher.fetch_one(&7).await.unwrap_err();
        assert_eq!(err.to_string(), "down");
        assert!(fetcher.fetch_many(&[1, 2]).await.unwrap().is_empty());
    }
}
