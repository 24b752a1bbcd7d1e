//! CLI command implementations.

use crate::simulation::{self, SimulationConfig, SimulationError};
use std::path::Path;
use thiserror::Error;

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Command-line overrides for a simulation run.
#[derive(Debug, Default, Clone)]
pub struct SimulateOverrides {
    pub keys: Option<u64>,
    pub requests: Option<usize>,
    pub rounds: Option<usize>,
    pub latency_ms: Option<u64>,
    pub failure_rate: Option<f64>,
    pub missing_ratio: Option<f64>,
    pub seed: Option<u64>,
}

impl SimulateOverrides {
    /// Applies every set override on top of `config`.
    pub fn apply(&self, mut config: SimulationConfig) -> SimulationConfig {
        if let Some(keys) = self.keys {
            config.key_space = keys;
        }
        if let Some(requests) = self.requests {
            config.requests_per_round = requests;
        }
        if let Some(rounds) = self.rounds {
            config.rounds = rounds;
        }
        if let Some(latency_ms) = self.latency_ms {
            config.latency_ms = latency_ms;
        }
        if let Some(failure_rate) = self.failure_rate {
            config.failure_rate = failure_rate;
        }
        if let Some(missing_ratio) = self.missing_ratio {
            config.missing_ratio = missing_ratio;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config
    }
}

/// Run a load simulation and print its report.
pub fn simulate(config_path: Option<&Path>, overrides: &SimulateOverrides, json: bool) -> Result<()> {
    let base = match config_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading simulation config");
            SimulationConfig::load(path)?
        }
        None => SimulationConfig::default(),
    };
    let config = overrides.apply(base);
    config.validate()?;

    tracing::info!(
        key_space = config.key_space,
        requests_per_round = config.requests_per_round,
        rounds = config.rounds,
        latency_ms = config.latency_ms,
        "Starting simulation"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulation::run(&config))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }

    Ok(())
}
