use std::process::ExitCode;

use anyhow::Context;
use coremr::{*, cli::*, kmeans::*};

/// Iterative K-means on the MapReduce engine, intermediate data in a local heap
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    job:        JobArgs,

    /// Heap size in MiB (default: sized from the dataset)
    #[arg(long)]
    heap_mib:   Option<usize>,

    /// Gap search policy of the heap
    #[arg(long, value_enum, default_value_t)]
    fit:        Fit,
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
    let cfg = args.engine_config();
    cfg.validate()?;
    let job = KMeans::new(args.dimensions, args.num_means)?;
    let requested_heap = cli.heap_mib
        .map(|mib| mib.checked_mul(1 << 20).ok_or_else(|| {
            MrError::Config(format!("heap of {mib} MiB does not fit the address space"))
        }))
        .transpose()?;

    let (mut points, _) = load_points(&args.data_file, args.dimensions)?;
    let centroids = seed_centroids(args.init, args.num_means, &points, &mut args.rng())?;

    let heap_bytes = match requested_heap {
        Some(bytes) => bytes,
        None => suggested_capacity(points.as_bytes().len(), &cfg)?,
    };
    let mut engine = Engine::new(cfg, HeapAllocator::new(heap_bytes, cli.fit)?)?;
    let mut clustering = job.clustering(centroids)?;

    let started = Instant::now();
    let reports = clustering
        .iterate(&mut engine, &mut points, args.iterations)
        .context("MapReduce iteration failed")?;
    let mapreduce = started.elapsed();

    debug!(
        iterations = reports.len(),
        high_water = engine.allocator().stats().high_water,
        "clustering done"
    );
    info!("centroids:\n{}", clustering.render());
    print_timings(mapreduce, total.elapsed());

    Ok(())
}
