//! Pieces shared by the `kmeans` binaries.

use std::process::ExitCode;

use clap::{error::ErrorKind, Args};
use rand::{rngs::StdRng, SeedableRng};

use crate::{helpe::*, kmeans::InitStrategy};

/// Job parameters common to every backend.
#[derive(Args, Debug)]
pub struct JobArgs {
    /// Number of mapper threads
    #[arg(value_parser = clap::value_parser!(usize))]
    pub map_tasks:      usize,

    /// Number of reducer threads
    #[arg(value_parser = clap::value_parser!(usize))]
    pub reduce_tasks:   usize,

    /// Number of clusters
    #[arg(value_parser = clap::value_parser!(usize))]
    pub num_means:      usize,

    /// Whitespace-separated points, one per line
    #[arg(value_parser = clap::value_parser!(PathBuf))]
    pub data_file:      PathBuf,

    /// Values per point
    #[arg(value_parser = clap::value_parser!(usize))]
    pub dimensions:     usize,

    /// MapReduce iterations to run
    #[arg(long, default_value_t = 10)]
    pub iterations:     usize,

    /// Minimum size of an intermediate block, in bytes
    #[arg(long, default_value_t = DEFAULT_BLOCK_CAPACITY)]
    pub block_bytes:    usize,

    /// How the initial centroids are picked
    #[arg(long, value_enum, default_value_t)]
    pub init:           InitStrategy,

    /// Seed for centroid initialisation (random when absent)
    #[arg(long)]
    pub seed:           Option<u64>,

    /// Log more (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose:        u8,
}

impl JobArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new(self.map_tasks, self.reduce_tasks).with_block_capacity(self.block_bytes)
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        }
    }
}

/// Parses the command line. On failure clap's message (usage included) is
/// printed and the exit code to return is handed back: 0 for `--help` and
/// `--version`, 1 for anything else.
pub fn parse_args<P: Parser>() -> Result<P, ExitCode> {
    P::try_parse().map_err(|e| {
        let _ = e.print();
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
            _ => ExitCode::from(1),
        }
    })
}

/// Logs go to stderr; stdout carries nothing but the timing lines.
pub fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .with_thread_names(verbose >= 1)
        .init();

    debug!("verbosity level: {}", verbose);
}

pub fn print_timings(mapreduce: Duration, total: Duration) {
    println!("[MAPREDUCE TIME] {:.6} seconds", mapreduce.as_secs_f64());
    println!("[TOTAL TIME] {:.6} seconds", total.as_secs_f64());
}

pub fn report_failure(err: &anyhow::Error) -> ExitCode {
    eprintln!("An error occurred: {err:#}");
    ExitCode::from(1)
}
