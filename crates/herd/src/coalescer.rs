//! Request coalescing into bulk fetches.
//!
//! Callers enqueue lookups by key. Every distinct key queued since the last
//! flush started is fetched together: one key goes through
//! [`Fetcher::fetch_one`], two or more go through [`Fetcher::fetch_many`].
//! Duplicate requests for a key that is still queued share one completion.
//!
//! ```text
//! request(A) ─┐                     ┌─► fetch_one(A)        (1 key)
//! request(B) ─┼──► PendingTable ──►─┤
//! request(B) ─┘     (swapped out    └─► fetch_many([A, B])  (2+ keys)
//!                    per flush)
//! ```
//!
//! Requests that arrive while a flush is in flight land in a fresh table and
//! are picked up by the next flush, which the driver starts as soon as the
//! current one has settled its keys.

use crate::{CoalesceError, CoalescerConfig, FetchError, Fetcher, Keyed, MissingKeyPolicy, Result};
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tracing::{debug, info_span, trace, Instrument};

/// Statistics for request coalescing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescerStats {
    /// Total requests received.
    pub total_requests: u64,
    /// Requests that attached to an already queued key.
    pub coalesced_requests: u64,
    /// Flushes run, counting every chained generation.
    pub flushes: u64,
    /// Distinct keys handed to the backend.
    pub keys_fetched: u64,
    /// Flushes that used the single-key path.
    pub single_fetches: u64,
    /// Flushes that used the multi-key path.
    pub batch_fetches: u64,
    /// Backend calls that failed.
    pub failed_fetches: u64,
    /// Keys resolved as absent.
    pub absent_results: u64,
    /// Bulk results that resolved no request.
    pub discarded_results: u64,
}

impl CoalescerStats {
    /// Returns the share of requests that rode along with another request.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }

    /// Returns the average number of keys per flush.
    pub fn mean_batch_size(&self) -> f64 {
        if self.flushes == 0 {
            0.0
        } else {
            self.keys_fetched as f64 / self.flushes as f64
        }
    }
}

#[derive(Default)]
struct CoalescerStatsInner {
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    flushes: AtomicU64,
    keys_fetched: AtomicU64,
    single_fetches: AtomicU64,
    batch_fetches: AtomicU64,
    failed_fetches: AtomicU64,
    absent_results: AtomicU64,
    discarded_results: AtomicU64,
}

impl CoalescerStatsInner {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoalescerStats {
        CoalescerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            keys_fetched: self.keys_fetched.load(Ordering::Relaxed),
            single_fetches: self.single_fetches.load(Ordering::Relaxed),
            batch_fetches: self.batch_fetches.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
            absent_results: self.absent_results.load(Ordering::Relaxed),
            discarded_results: self.discarded_results.load(Ordering::Relaxed),
        }
    }
}

/// The eventual outcome of a [`Coalescer::request`].
///
/// Resolves to `Ok(Some(value))`, `Ok(None)` when the key does not exist, or
/// the error that failed its flush. Clones observe the same outcome.
pub struct Completion<V> {
    inner: Shared<BoxFuture<'static, Result<Option<V>>>>,
}

impl<V> Clone for Completion<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> fmt::Debug for Completion<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl<V: Clone> Future for Completion<V> {
    type Output = Result<Option<V>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// One queued key: the sending half of its completion plus the shared
/// receiving half handed to every requester.
struct PendingRequest<V> {
    sender: oneshot::Sender<Result<Option<V>>>,
    completion: Completion<V>,
}

impl<V> PendingRequest<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let future = receiver
            .map(|received| received.unwrap_or(Err(CoalesceError::Abandoned)))
            .boxed();
        Self {
            sender,
            completion: Completion {
                inner: future.shared(),
            },
        }
    }
}

impl<V> PendingRequest<V> {
    /// Consumes the request, so each key settles at most once.
    fn settle(self, outcome: Result<Option<V>>) {
        // The requesters may all have dropped their completions.
        let _ = self.sender.send(outcome);
    }
}

/// Keys waiting for the next flush, kept in first-request order.
struct PendingTable<K, V> {
    order: Vec<K>,
    entries: HashMap<K, PendingRequest<V>>,
}

impl<K, V> Default for PendingTable<K, V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }
}

impl<K, V> PendingTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<Completion<V>> {
        self.entries.get(key).map(|entry| entry.completion.clone())
    }

    fn insert(&mut self, key: K) -> Completion<V> {
        let entry = PendingRequest::new();
        let completion = entry.completion.clone();
        self.order.push(key.clone());
        self.entries.insert(key, entry);
        completion
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Marks a flush generation in progress. Resolves once that generation has
/// settled every key it took, whether or not the fetch succeeded.
#[derive(Clone)]
struct FlushHandle {
    generation: u64,
    done: Shared<BoxFuture<'static, ()>>,
}

impl FlushHandle {
    fn new(generation: u64) -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel::<()>();
        let done = rx.map(|_| ()).boxed().shared();
        (tx, Self { generation, done })
    }
}

struct State<K, V> {
    pending: PendingTable<K, V>,
    flush: Option<FlushHandle>,
    generations: u64,
}

impl<K, V> State<K, V> {
    /// Installs a handle for the next generation and returns its signal.
    fn begin_flush(&mut self) -> (oneshot::Sender<()>, u64) {
        let generation = self.generations;
        self.generations += 1;
        let (done, handle) = FlushHandle::new(generation);
        self.flush = Some(handle);
        (done, generation)
    }
}

struct Inner<K, V> {
    fetcher: Arc<dyn Fetcher<K, V>>,
    config: CoalescerConfig,
    state: Mutex<State<K, V>>,
    stats: CoalescerStatsInner,
}

/// Batches concurrent lookups into single- or multi-key backend calls.
///
/// The coalescer is a cheap handle around shared state; clone it to hand it
/// to other tasks. Flushes run on the Tokio runtime the first request of a
/// flush window was made from.
pub struct Coalescer<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Coalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for Coalescer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Coalescer")
            .field("name", &self.inner.config.name)
            .field("pending", &state.pending.entries.len())
            .field("flushing", &state.flush.as_ref().map(|h| h.generation))
            .finish()
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    /// Creates a coalescer with the default configuration.
    pub fn new<F>(fetcher: F) -> Self
    where
        F: Fetcher<K, V>,
    {
        Self::with_config(fetcher, CoalescerConfig::default())
    }

    /// Creates a coalescer.
    pub fn with_config<F>(fetcher: F, config: CoalescerConfig) -> Self
    where
        F: Fetcher<K, V>,
    {
        Self {
            inner: Arc::new(Inner {
                fetcher: Arc::new(fetcher),
                config,
                state: Mutex::new(State {
                    pending: PendingTable::default(),
                    flush: None,
                    generations: 0,
                }),
                stats: CoalescerStatsInner::default(),
            }),
        }
    }

    /// Returns the backend this coalescer fetches from.
    pub fn fetcher(&self) -> &Arc<dyn Fetcher<K, V>> {
        &self.inner.fetcher
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CoalescerConfig {
        &self.inner.config
    }

    /// Queues a lookup for `key`.
    ///
    /// The key is registered immediately; the returned completion only has to
    /// be awaited to observe the outcome. If `key` is already queued the
    /// existing completion is shared. Otherwise a new entry is queued and, if
    /// no flush is running, one is spawned.
    ///
    /// # Panics
    ///
    /// Panics if a flush has to be started outside of a Tokio runtime. The
    /// coalescer is left untouched in that case.
    pub fn request(&self, key: K) -> Completion<V> {
        let inner = &self.inner;

        let (completion, start) = {
            let mut state = inner.state.lock();
            if let Some(existing) = state.pending.get(&key) {
                CoalescerStatsInner::bump(&inner.stats.total_requests, 1);
                CoalescerStatsInner::bump(&inner.stats.coalesced_requests, 1);
                return existing;
            }

            // Resolved before the table changes so a missing runtime leaves
            // no queued key and no flush marker behind.
            let runtime = if state.flush.is_some() {
                None
            } else {
                match Handle::try_current() {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        drop(state);
                        panic!(
                            "coalescer `{}` cannot start a flush outside a Tokio runtime: {e}",
                            inner.config.name
                        );
                    }
                }
            };

            CoalescerStatsInner::bump(&inner.stats.total_requests, 1);
            let completion = state.pending.insert(key);
            let start = runtime.map(|handle| (handle, state.begin_flush()));
            (completion, start)
        };

        if let Some((handle, (done, generation))) = start {
            let driver = Driver {
                inner: Arc::clone(inner),
                generation,
                done: Some(done),
            };
            let span = info_span!("coalescer", name = %inner.config.name);
            handle.spawn(driver.run().instrument(span));
        }

        completion
    }

    /// Queues lookups for several keys in order, returning their completions
    /// in the same order.
    pub fn request_many<I>(&self, keys: I) -> Vec<Completion<V>>
    where
        I: IntoIterator<Item = K>,
    {
        keys.into_iter().map(|key| self.request(key)).collect()
    }

    /// Waits until the running flush, and the flush it chained into if any,
    /// have settled.
    ///
    /// Work queued before this call is settled once it returns. Fetch
    /// failures are not reported here; they reach each request's completion.
    pub async fn await_idle(&self) {
        let Some(current) = self.active_flush() else {
            return;
        };
        current.done.await;

        // The next generation is installed before the previous one signals.
        if let Some(next) = self.active_flush() {
            next.done.await;
        }
    }

    /// Returns true when no flush is in progress.
    pub fn is_available(&self) -> bool {
        self.inner.state.lock().flush.is_none()
    }

    /// Returns the number of distinct keys queued for the next flush.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Returns statistics.
    pub fn stats(&self) -> CoalescerStats {
        self.inner.stats.snapshot()
    }

    fn active_flush(&self) -> Option<FlushHandle> {
        self.inner.state.lock().flush.clone()
    }
}

/// Owns the done signal of the generation being flushed.
///
/// Dropping a driver that still holds its signal means the flush task
/// stopped before the chain ended: its runtime shut down, or a panic escaped
/// the backend guard. The drop then releases the coalescer so that later
/// requests start a fresh flush instead of waiting on a dead one.
struct Driver<K, V> {
    inner: Arc<Inner<K, V>>,
    generation: u64,
    done: Option<oneshot::Sender<()>>,
}

impl<K, V> Driver<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    /// Runs flush generations until the pending table stays empty.
    async fn run(mut self) {
        loop {
            let batch = std::mem::take(&mut self.inner.state.lock().pending);
            self.inner.flush(self.generation, batch).await;

            let next = {
                let mut state = self.inner.state.lock();
                if state.pending.is_empty() {
                    state.flush = None;
                    None
                } else {
                    Some(state.begin_flush())
                }
            };

            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }

            match next {
                Some((done, generation)) => {
                    trace!(generation, "Chaining flush for requests queued mid-flight");
                    self.done = Some(done);
                    self.generation = generation;
                }
                None => break,
            }
        }
    }
}

impl<K, V> Drop for Driver<K, V> {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };

        let queued = {
            let mut state = self.inner.state.lock();
            let current = state.flush.as_ref().map(|handle| handle.generation);
            if current != Some(self.generation) {
                return;
            }
            state.flush = None;
            std::mem::take(&mut state.pending)
        };

        debug!(
            generation = self.generation,
            abandoned = queued.entries.len(),
            "Flush driver stopped early"
        );

        // Keys of the interrupted batch are abandoned when their entries drop
        // with the flush future.
        for entry in queued.entries.into_values() {
            entry.settle(Err(CoalesceError::Abandoned));
        }
        let _ = done.send(());
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Keyed<K> + Clone + Send + Sync + 'static,
{
    async fn flush(&self, generation: u64, batch: PendingTable<K, V>) {
        let PendingTable { order, mut entries } = batch;
        if order.is_empty() {
            return;
        }

        CoalescerStatsInner::bump(&self.stats.flushes, 1);
        CoalescerStatsInner::bump(&self.stats.keys_fetched, order.len() as u64);

        debug!(
            generation,
            batch_size = order.len(),
            path = if order.len() == 1 { "single" } else { "many" },
            "Flush started"
        );

        if order.len() == 1 {
            let key = &order[0];
            if let Some(entry) = entries.remove(key) {
                self.flush_one(generation, key, entry).await;
            }
        } else {
            self.flush_many(generation, order, entries).await;
        }
    }

    async fn flush_one(&self, generation: u64, key: &K, entry: PendingRequest<V>) {
        CoalescerStatsInner::bump(&self.stats.single_fetches, 1);

        let outcome = match guard(self.fetcher.fetch_one(key)).await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => match self.config.missing_key_policy {
                MissingKeyPolicy::Absent => {
                    CoalescerStatsInner::bump(&self.stats.absent_results, 1);
                    Ok(None)
                }
                MissingKeyPolicy::Reject => Err(CoalesceError::NotFound),
            },
            Err(e) => {
                CoalescerStatsInner::bump(&self.stats.failed_fetches, 1);
                Err(CoalesceError::Fetch(e))
            }
        };

        trace!(
            generation,
            ok = outcome.is_ok(),
            "Single-key flush settled"
        );
        entry.settle(outcome);
    }

    async fn flush_many(
        &self,
        generation: u64,
        keys: Vec<K>,
        mut entries: HashMap<K, PendingRequest<V>>,
    ) {
        CoalescerStatsInner::bump(&self.stats.batch_fetches, 1);

        let values = match guard(self.fetcher.fetch_many(&keys)).await {
            Ok(values) => values,
            Err(e) => {
                CoalescerStatsInner::bump(&self.stats.failed_fetches, 1);
                let error = CoalesceError::Fetch(e);
                for key in &keys {
                    if let Some(entry) = entries.remove(key) {
                        entry.settle(Err(error.clone()));
                    }
                }
                trace!(
                    generation,
                    batch_size = keys.len(),
                    "Multi-key flush failed"
                );
                return;
            }
        };

        let mut resolved = 0u64;
        let mut discarded = 0u64;
        for value in values {
            // Removing the entry means a repeated id only resolves once.
            let entry = value
                .as_ref()
                .and_then(|v| v.key())
                .and_then(|key| entries.remove(key));
            match entry {
                Some(entry) => {
                    entry.settle(Ok(value));
                    resolved += 1;
                }
                None => discarded += 1,
            }
        }

        let mut absent = 0u64;
        for key in &keys {
            if let Some(entry) = entries.remove(key) {
                entry.settle(Ok(None));
                absent += 1;
            }
        }

        CoalescerStatsInner::bump(&self.stats.absent_results, absent);
        CoalescerStatsInner::bump(&self.stats.discarded_results, discarded);

        trace!(
            generation,
            resolved,
            absent,
            discarded,
            "Multi-key flush settled"
        );
    }
}

/// Turns a panic inside a backend call into a fetch error.
async fn guard<T, Fut>(fetch: Fut) -> std::result::Result<T, FetchError>
where
    Fut: Future<Output = std::result::Result<T, FetchError>>,
{
    AssertUnwindSafe(fetch)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(FetchError::msg("fetch panicked")))
}
