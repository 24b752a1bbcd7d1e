//! Property-based tests for the coalescing invariants.

mod support;

use futures::future::join_all;
use futures::FutureExt;
use herd::Coalescer;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use support::{Call, ManyMode, MockBackend, Record, SingleMode};

const STORED: [(&str, u32); 6] = [
    ("Hello", 0),
    ("World", 1),
    ("Foo", 2),
    ("Bar", 3),
    ("Test1", 4),
    ("Test2", 5),
];

/// Keys drawn from the stored rows plus two that do not exist.
fn key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => prop::sample::select(STORED.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>()),
        1 => prop::sample::select(vec!["Test3".to_string(), "Missing".to_string()]),
    ]
}

fn many_mode_strategy() -> impl Strategy<Value = ManyMode> {
    prop_oneof![
        Just(ManyMode::Omit),
        Just(ManyMode::Nulls),
        Just(ManyMode::Reversed),
        Just(ManyMode::Duplicated),
        Just(ManyMode::Noisy),
    ]
}

fn expected(key: &str) -> Option<Record> {
    STORED
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(k, v)| Record::new(k, *v))
}

fn distinct(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.iter()
        .filter(|key| seen.insert(key.as_str()))
        .cloned()
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: one window of requests makes exactly one backend call and
    /// every request sees its own key's row.
    #[test]
    fn prop_single_window_no_cross_talk(
        keys in prop::collection::vec(key_strategy(), 1..24),
        many in many_mode_strategy(),
    ) {
        let backend = Arc::new(MockBackend::new(SingleMode::Absent, many));
        let coalescer: Coalescer<String, Record> = Coalescer::new(Arc::clone(&backend));

        let results = runtime().block_on(async {
            let results = join_all(coalescer.request_many(keys.clone())).await;
            coalescer.await_idle().await;
            results
        });

        for (key, result) in keys.iter().zip(results) {
            prop_assert_eq!(result.unwrap(), expected(key));
        }

        let unique = distinct(&keys);
        let calls = backend.calls();
        prop_assert_eq!(calls.len(), 1);
        if unique.len() == 1 {
            prop_assert_eq!(&calls[0], &Call::One(unique[0].clone()));
        } else {
            prop_assert_eq!(&calls[0], &Call::Many(unique));
        }
        prop_assert!(coalescer.is_available());
    }

    /// Property: requests queued while a flush is in flight are served by
    /// exactly one follow-up flush, and every completion settles before
    /// await_idle returns.
    #[test]
    fn prop_chained_window_settles_everything(
        first in prop::collection::vec(key_strategy(), 1..12),
        second in prop::collection::vec(key_strategy(), 1..12),
    ) {
        let backend = Arc::new(MockBackend::new(SingleMode::Absent, ManyMode::Nulls));
        let coalescer: Coalescer<String, Record> = Coalescer::new(Arc::clone(&backend));

        let outcomes = runtime().block_on(async {
            let mut completions = coalescer.request_many(first.clone());
            while coalescer.pending_len() > 0 {
                tokio::task::yield_now().await;
            }
            completions.extend(coalescer.request_many(second.clone()));

            coalescer.await_idle().await;
            completions
                .into_iter()
                .map(|c| c.now_or_never())
                .collect::<Vec<_>>()
        });

        for (key, outcome) in first.iter().chain(second.iter()).zip(outcomes) {
            let outcome = outcome.expect("settled before await_idle returned");
            prop_assert_eq!(outcome.unwrap(), expected(key));
        }

        let calls = backend.calls();
        prop_assert_eq!(calls.len(), 2);
        let fetched = |call: &Call| match call {
            Call::One(key) => vec![key.clone()],
            Call::Many(keys) => keys.clone(),
        };
        prop_assert_eq!(fetched(&calls[0]), distinct(&first));
        prop_assert_eq!(fetched(&calls[1]), distinct(&second));
        prop_assert!(coalescer.is_available());
    }
}
