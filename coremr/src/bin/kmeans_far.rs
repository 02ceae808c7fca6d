use std::{net::SocketAddr, process::ExitCode};

use anyhow::Context;
use coremr::{*, cli::*, kmeans::*};
use farmem::{FarConfig, FarMemory};

/// Iterative K-means on the MapReduce engine, dataset and intermediate data in far memory
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML file with the far memory settings
    #[arg(value_parser = clap::value_parser!(PathBuf))]
    config:     PathBuf,

    /// Address of the memory server
    #[arg(value_parser = clap::value_parser!(SocketAddr))]
    endpoint:   SocketAddr,

    #[command(flatten)]
    job:        JobArgs,
}

fn main() -> ExitCode {
    let total = Instant::now();
    let cli: Args = match parse_args() {
        Ok(a) => a,
        Err(code) => return code,
    };
    init_tracing(cli.job.verbose);

    match run(&cli, total) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_failure(&e),
    }
}

fn run(cli: &Args, total: Instant) -> anyhow::Result<()> {
    let args = &cli.job;
    args.engine_config().validate()?;
    let far_cfg = FarConfig::from_path(&cli.config)?;
    let mem = Arc::new(FarMemory::connect(far_cfg.clone(), cli.endpoint)?);
    let job = FarKMeans::new(args.dimensions, args.num_means)?;

    let (points, _) = load_points(&args.data_file, args.dimensions)?;
    let centroids = seed_centroids(args.init, args.num_means, &points, &mut args.rng())?;
    let mut dataset = FarDataset::upload(mem.clone(), &points, far_cfg.block_bytes)
        .context("cannot upload dataset to far memory")?;
    drop(points);

    let mut engine = Engine::new(args.engine_config(), FarAllocator::new(mem.clone()))?;
    let mut clustering = job.clustering(centroids)?;

    let started = Instant::now();
    let reports = clustering
        .iterate(&mut engine, &mut dataset, args.iterations)
        .context("MapReduce iteration failed")?;
    let mapreduce = started.elapsed();

    debug!(iterations = reports.len(), stats = ?mem.stats(), "clustering done");
    info!("centroids:\n{}", clustering.render());
    print_timings(mapreduce, total.elapsed());

    Ok(())
}
