//! In-memory backend shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use herd::{FetchError, Fetcher, Keyed};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// A stored row. `id` is optional so tests can hand back malformed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: Option<String>,
    pub value: u32,
}

impl Record {
    pub fn new(id: &str, value: u32) -> Self {
        Self {
            id: Some(id.to_string()),
            value,
        }
    }
}

impl Keyed<String> for Record {
    fn key(&self) -> Option<&String> {
        self.id.as_ref()
    }
}

/// How the single-key lookup reports a miss.
#[derive(Debug, Clone, Copy)]
pub enum SingleMode {
    /// `Ok(None)`.
    Absent,
    /// `Err("Key '<k>' does not exist.")`.
    Throws,
}

/// How the bulk lookup shapes its result.
#[derive(Debug, Clone, Copy)]
pub enum ManyMode {
    /// Found rows only, in request order.
    Omit,
    /// One slot per key, `None` for misses.
    Nulls,
    /// Fails the whole call on the first miss.
    Throws,
    /// Found rows in reverse order.
    Reversed,
    /// Every found row twice.
    Duplicated,
    /// Found rows plus a row without an id and a row for an unrequested key.
    Noisy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    One(String),
    Many(Vec<String>),
}

pub struct MockBackend {
    data: HashMap<String, Record>,
    single: SingleMode,
    many: ManyMode,
    latency: Duration,
    calls: Mutex<Vec<Call>>,
}

impl MockBackend {
    pub fn new(single: SingleMode, many: ManyMode) -> Self {
        let data = [
            ("Hello", 0),
            ("World", 1),
            ("Foo", 2),
            ("Bar", 3),
            ("Test1", 4),
            ("Test2", 5),
        ]
        .into_iter()
        .map(|(id, value)| (id.to_string(), Record::new(id, value)))
        .collect();

        Self {
            data,
            single,
            many,
            latency: Duration::from_millis(1),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn missing(key: &str) -> FetchError {
        FetchError::msg(format!("Key '{}' does not exist.", key))
    }
}

#[async_trait]
impl Fetcher<String, Record> for MockBackend {
    async fn fetch_one(&self, key: &String) -> Result<Option<Record>, FetchError> {
        self.calls.lock().push(Call::One(key.clone()));
        tokio::time::sleep(self.latency).await;

        match (self.data.get(key), self.single) {
            (Some(record), _) => Ok(Some(record.clone())),
            (None, SingleMode::Absent) => Ok(None),
            (None, SingleMode::Throws) => Err(Self::missing(key)),
        }
    }

    async fn fetch_many(&self, keys: &[String]) -> Result<Vec<Option<Record>>, FetchError> {
        self.calls.lock().push(Call::Many(keys.to_vec()));
        tokio::time::sleep(self.latency).await;

        let found = keys.iter().filter_map(|key| self.data.get(key).cloned());
        let rows = match self.many {
            ManyMode::Omit => found.map(Some).collect(),
            ManyMode::Nulls => keys
                .iter()
                .map(|key| self.data.get(key).cloned())
                .collect(),
            ManyMode::Throws => {
                if let Some(key) = keys.iter().find(|key| !self.data.contains_key(*key)) {
                    return Err(Self::missing(key));
                }
                found.map(Some).collect()
            }
            ManyMode::Reversed => {
                let mut rows: Vec<_> = found.map(Some).collect();
                rows.reverse();
                rows
            }
            ManyMode::Duplicated => found.flat_map(|row| [Some(row.clone()), Some(row)]).collect(),
            ManyMode::Noisy => {
                let mut rows = vec![
                    Some(Record { id: None, value: 99 }),
                    Some(Record::new("Unrequested", 98)),
                    None,
                ];
                rows.extend(found.map(Some));
                rows
            }
        };
        Ok(rows)
    }
}
