//! # Herd
//!
//! Request coalescing for key-value backends that offer both a single-key
//! and a bulk lookup.
//!
//! Callers ask a [`Coalescer`] for individual keys. Every distinct key queued
//! while the coalescer is idle, or while a previous flush is running, is
//! fetched together in the next flush:
//!
//! - one key: [`Fetcher::fetch_one`]
//! - two or more keys: [`Fetcher::fetch_many`], with results routed back to
//!   their requesters through [`Keyed::key`]
//!
//! Duplicate requests for a queued key share one [`Completion`]. Every
//! requested key settles exactly once, with a value, an absence (`None`), or
//! the backend error that failed its flush.
//!
//! ## Example
//!
//! ```rust,no_run
//! use herd::{Coalescer, FetchError, FnFetcher, Keyed};
//!
//! #[derive(Debug, Clone)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! impl Keyed<u64> for User {
//!     fn key(&self) -> Option<&u64> {
//!         Some(&self.id)
//!     }
//! }
//!
//! fn load(id: u64) -> User {
//!     User { id, name: format!("user-{id}") }
//! }
//!
//! # async fn run() -> Result<(), herd::CoalesceError> {
//! let users = Coalescer::new(FnFetcher::<u64, User, _, _>::new(
//!     |id: u64| async move { Ok::<_, FetchError>(Some(load(id))) },
//!     |ids: Vec<u64>| async move {
//!         Ok::<_, FetchError>(ids.into_iter().map(|id| Some(load(id))).collect())
//!     },
//! ));
//!
//! // Both lookups are served by one `fetch_many` call.
//! let (a, b) = futures::join!(users.request(1), users.request(2));
//! assert_eq!(a?.map(|u| u.name), Some("user-1".to_string()));
//! assert!(b?.is_some());
//!
//! users.await_idle().await;
//! # Ok(())
//! # }
//! ```

mod coalescer;
mod config;
mod error;
mod fetch;

pub use coalescer::{Coalescer, CoalescerStats, Completion};
pub use config::{CoalescerConfig, MissingKeyPolicy};
pub use error::{CoalesceError, FetchError};
pub use fetch::{Fetcher, FnFetcher, Keyed};

/// Result type for coalesced requests.
pub type Result<T> = std::result::Result<T, CoalesceError>;
