//! # vantage-prober
//!
//! Continuously estimates the liveness of every routed /24 in a probelist
//! by probing one sampled host per block per round and fusing outcomes
//! through a per-block Bayesian belief update.
//!
//! ## Usage
//!
//! ```bash
//! # probe with the synthetic test driver, ten-minute rounds
//! vantage-prober probelist.json.gz
//!
//! # two driver instances, short rounds, bounded run
//! vantage-prober -d 60000 -s 30 -l 10 -A \
//!   -D test max-rtt=500 -D test max-rtt=500 probelist.json
//!
//! # write time-series points to a file instead of stdout
//! vantage-prober --ts-file points.out probelist.json
//! ```
//!
//! SIGINT/SIGTERM shut down gracefully; SIGHUP reloads the probelist at
//! the next round boundary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vantage_prober::{signals, Prober, ProberParams};
use vantage_timeseries::{GraphiteSink, Sink};

#[derive(Parser, Debug)]
#[command(name = "vantage-prober", about = "Continuous /24 outage prober")]
struct Cli {
    /// Probelist file (JSON; .gz/.bz2/.zst are decompressed by suffix).
    probelist: PathBuf,

    /// Prober name used in metric paths.
    #[arg(long, default_value = "default")]
    name: String,

    /// Periodic round duration in milliseconds.
    #[arg(short = 'd', long, default_value_t = 600_000)]
    round_duration: u64,

    /// Number of slices a round is divided into.
    #[arg(short = 's', long, default_value_t = 60)]
    slices: u32,

    /// Stop after this many rounds.
    #[arg(short = 'l', long)]
    round_limit: Option<u32>,

    /// Per-probe wait timeout in seconds.
    #[arg(short = 't', long, default_value_t = 3)]
    probe_timeout: u8,

    /// Do not sleep to align the first round with the round duration.
    #[arg(short = 'A', long)]
    no_align: bool,

    /// Probe driver as NAME CONFIG (repeatable; default: one test driver).
    #[arg(
        short = 'D',
        long = "driver",
        num_args = 2,
        value_names = ["NAME", "CONFIG"],
        action = clap::ArgAction::Append
    )]
    drivers: Vec<String>,

    /// Write time-series points to this file instead of stdout.
    #[arg(long)]
    ts_file: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    if let Err(e) = run() {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let sink: Arc<dyn Sink> = match &cli.ts_file {
        Some(path) => Arc::new(
            GraphiteSink::file(path)
                .with_context(|| format!("could not open {}", path.display()))?,
        ),
        None => Arc::new(GraphiteSink::stdout()),
    };

    let params = ProberParams {
        round_duration_ms: cli.round_duration,
        slice_count: cli.slices,
        round_limit: cli.round_limit,
        probe_timeout_s: cli.probe_timeout,
        sleep_align_start: !cli.no_align,
    };

    info!(
        name = %cli.name,
        probelist = %cli.probelist.display(),
        round_duration_ms = params.round_duration_ms,
        slices = params.slice_count,
        round_limit = ?params.round_limit,
        "vantage-prober starting"
    );

    let mut prober = Prober::new(
        &cli.name,
        &cli.probelist,
        Arc::clone(&sink),
        sink,
        params,
    )?;

    for pair in cli.drivers.chunks(2) {
        let name = &pair[0];
        let config = pair.get(1).map(String::as_str).unwrap_or_default();
        prober.add_driver(name, config)?;
    }

    signals::install(&prober.shutdown_flag(), &prober.reload_flag())
        .context("could not install signal handlers")?;

    prober.run()
}
