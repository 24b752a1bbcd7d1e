//! Herd CLI - load simulation for the request coalescer.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;
mod simulation;

/// Herd - request coalescing load simulator
#[derive(Parser, Debug)]
#[command(name = "herd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fire bursts of concurrent lookups at a coalescer and report batching
    Simulate(SimulateArgs),

    /// Show version information
    Version,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// YAML file with simulation settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of keys held by the backend
    #[arg(long)]
    keys: Option<u64>,

    /// Concurrent requests per round
    #[arg(long)]
    requests: Option<usize>,

    /// Number of rounds
    #[arg(long)]
    rounds: Option<usize>,

    /// Backend latency per call in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Probability that a backend call fails
    #[arg(long)]
    failure_rate: Option<f64>,

    /// Share of requests for keys the backend does not hold
    #[arg(long)]
    missing_ratio: Option<f64>,

    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();

    logging::init_logging(logging::level_for_verbosity(cli.verbose), cli.json_logs);

    let result = match cli.command {
        Commands::Simulate(args) => {
            let overrides = commands::SimulateOverrides {
                keys: args.keys,
                requests: args.requests,
                rounds: args.rounds,
                latency_ms: args.latency_ms,
                failure_rate: args.failure_rate,
                missing_ratio: args.missing_ratio,
                seed: args.seed,
            };
            commands::simulate(args.config.as_deref(), &overrides, args.json)
        }
        Commands::Version => {
            println!("herd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
