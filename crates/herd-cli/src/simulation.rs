//! Load simulation against an in-memory backend.
//!
//! Each round fires a burst of concurrent requests with random keys (some
//! duplicated, some missing) at a shared coalescer, then waits for it to go
//! idle. The report shows how many backend calls the burst collapsed into.

use async_trait::async_trait;
use herd::{Coalescer, CoalescerConfig, CoalescerStats, FetchError, Fetcher, Keyed};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised while preparing a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid simulation setting: {0}")]
    Invalid(String),
}

/// Largest key space whose missing-key range still fits in a `u64`.
pub const MAX_KEY_SPACE: u64 = u64::MAX / 2;

/// Simulation settings, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of keys the backend holds.
    pub key_space: u64,
    /// Share of requests aimed at keys the backend does not hold.
    pub missing_ratio: f64,
    /// Concurrent requests per round.
    pub requests_per_round: usize,
    /// Number of rounds.
    pub rounds: usize,
    /// Artificial backend latency per call.
    pub latency_ms: u64,
    /// Probability that a backend call fails.
    pub failure_rate: f64,
    /// RNG seed for reproducible runs.
    pub seed: Option<u64>,
    /// Coalescer settings.
    pub coalescer: CoalescerConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            key_space: 64,
            missing_ratio: 0.05,
            requests_per_round: 256,
            rounds: 10,
            latency_ms: 5,
            failure_rate: 0.0,
            seed: None,
            coalescer: CoalescerConfig::named("simulation"),
        }
    }
}

impl SimulationConfig {
    /// Loads settings from a YAML file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, SimulationError> {
        let raw = std::fs::read_to_string(path)?;
        let config: SimulationConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Checks that the settings describe a runnable simulation.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.key_space == 0 {
            return Err(SimulationError::Invalid("key_space must be positive".into()));
        }
        // Missing keys are drawn from `key_space..2 * key_space`.
        if self.key_space > MAX_KEY_SPACE {
            return Err(SimulationError::Invalid(format!(
                "key_space must be at most {MAX_KEY_SPACE}, got {}",
                self.key_space
            )));
        }
        if self.requests_per_round == 0 {
            return Err(SimulationError::Invalid(
                "requests_per_round must be positive".into(),
            ));
        }
        for (name, ratio) in [
            ("missing_ratio", self.missing_ratio),
            ("failure_rate", self.failure_rate),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(SimulationError::Invalid(format!(
                    "{name} must be within [0, 1], got {ratio}"
                )));
            }
        }
        Ok(())
    }
}

/// A row served by the simulated backend.
#[derive(Debug, Clone)]
pub struct Row {
    pub id: u64,
    pub value: String,
}

impl Keyed<u64> for Row {
    fn key(&self) -> Option<&u64> {
        Some(&self.id)
    }
}

/// Backend holding keys `0..key_space`, with latency and random failures.
pub struct SimulatedBackend {
    key_space: u64,
    latency: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedBackend {
    pub fn new(config: &SimulationConfig, rng: StdRng) -> Self {
        Self {
            key_space: config.key_space,
            latency: Duration::from_millis(config.latency_ms),
            failure_rate: config.failure_rate,
            rng: Mutex::new(rng),
        }
    }

    fn lookup(&self, key: u64) -> Option<Row> {
        (key < self.key_space).then(|| Row {
            id: key,
            value: format!("row-{key}"),
        })
    }

    async fn call(&self) -> Result<(), FetchError> {
        tokio::time::sleep(self.latency).await;
        let failed = self.failure_rate > 0.0 && self.rng.lock().gen_bool(self.failure_rate);
        if failed {
            return Err(FetchError::msg("simulated backend failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher<u64, Row> for SimulatedBackend {
    async fn fetch_one(&self, key: &u64) -> Result<Option<Row>, FetchError> {
        self.call().await?;
        Ok(self.lookup(*key))
    }

    async fn fetch_many(&self, keys: &[u64]) -> Result<Vec<Option<Row>>, FetchError> {
        self.call().await?;
        Ok(keys.iter().filter_map(|key| self.lookup(*key)).map(Some).collect())
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub rounds: usize,
    pub requests: u64,
    pub found: u64,
    pub absent: u64,
    pub failed: u64,
    pub elapsed_ms: u64,
    pub coalescing_ratio: f64,
    pub mean_batch_size: f64,
    pub stats: CoalescerStats,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulation Report")?;
        writeln!(f, "=================")?;
        writeln!(f, "Rounds:           {}", self.rounds)?;
        writeln!(f, "Requests:         {}", self.requests)?;
        writeln!(
            f,
            "Outcomes:         {} found, {} absent, {} failed",
            self.found, self.absent, self.failed
        )?;
        writeln!(
            f,
            "Backend calls:    {} ({} single, {} bulk)",
            self.stats.flushes, self.stats.single_fetches, self.stats.batch_fetches
        )?;
        writeln!(f, "Coalesced:        {:.1}%", self.coalescing_ratio * 100.0)?;
        writeln!(f, "Mean batch size:  {:.2}", self.mean_batch_size)?;
        write!(f, "Elapsed:          {} ms", self.elapsed_ms)
    }
}

/// Runs the simulation described by `config`.
pub async fn run(config: &SimulationConfig) -> Result<Report, SimulationError> {
    config.validate()?;

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let backend = SimulatedBackend::new(config, StdRng::seed_from_u64(rng.gen()));
    let coalescer: Coalescer<u64, Row> = Coalescer::with_config(backend, config.coalescer.clone());

    let started = Instant::now();
    let (mut found, mut absent, mut failed) = (0u64, 0u64, 0u64);

    for round in 0..config.rounds {
        let keys: Vec<u64> = (0..config.requests_per_round)
            .map(|_| {
                if rng.gen_bool(config.missing_ratio) {
                    config.key_space + rng.gen_range(0..config.key_space)
                } else {
                    rng.gen_range(0..config.key_space)
                }
            })
            .collect();

        let handles: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let coalescer = coalescer.clone();
                tokio::spawn(async move { coalescer.request(key).await })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            match handle {
                Ok(Ok(Some(row))) => {
                    tracing::trace!(id = row.id, value = %row.value, "Resolved");
                    found += 1;
                }
                Ok(Ok(None)) => absent += 1,
                Ok(Err(_)) => failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Request task failed");
                    failed += 1;
                }
            }
        }

        coalescer.await_idle().await;
        tracing::info!(round, stats = ?coalescer.stats(), "Round complete");
    }

    let stats = coalescer.stats();
    Ok(Report {
        rounds: config.rounds,
        requests: stats.total_requests,
        found,
        absent,
        failed,
        elapsed_ms: started.elapsed().as_millis() as u64,
        coalescing_ratio: stats.coalescing_ratio(),
        mean_batch_size: stats.mean_batch_size(),
        stats,
    })
}
