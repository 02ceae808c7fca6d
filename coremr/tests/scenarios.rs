use std::sync::Arc;

use coremr::{kmeans::*, *};
use farmem::{FarConfig, FarMemory};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn four_points() -> PointBuffer {
    PointBuffer::from_coords(1, &[0.0, 1.0, 9.0, 10.0]).unwrap()
}

fn heap_engine(maps: usize, reds: usize) -> Engine<HeapAllocator> {
    Engine::new(EngineConfig::new(maps, reds), HeapAllocator::new(1 << 20, Fit::First).unwrap()).unwrap()
}

fn far_pool() -> Arc<FarMemory> {
    let cfg = FarConfig { cache_bytes: 4096, far_bytes: 1 << 20, block_bytes: 32 };
    Arc::new(FarMemory::connect(cfg, "127.0.0.1:9000".parse().unwrap()).unwrap())
}

fn one_pass(maps: usize, reds: usize) -> (Vec<f64>, Vec<usize>) {
    let mut engine = heap_engine(maps, reds);
    let mut points = four_points();
    let mut clustering = KMeans::new(1, 2).unwrap()
        .clustering(AggregateState::from_rows(1, vec![0.0, 9.0]).unwrap())
        .unwrap();
    let reports = clustering.iterate(&mut engine, &mut points, 1).unwrap();
    assert_eq!(reports[0].records_emitted(), 4);
    assert_eq!(reports[0].records_reduced(), 4);

    (clustering.into_centroids().into_inner(), points.labels())
}

#[test]
fn single_mapper_single_reducer() {
    let (centroids, labels) = one_pass(1, 1);
    assert_eq!(centroids, vec![0.5, 9.5]);
    assert_eq!(labels, vec![0, 0, 1, 1]);
}

#[test]
fn two_mappers_two_reducers_agree() {
    assert_eq!(one_pass(2, 2), one_pass(1, 1));
}

#[test]
fn more_workers_than_points() {
    let (centroids, labels) = one_pass(8, 5);
    assert_eq!(centroids, vec![0.5, 9.5]);
    assert_eq!(labels, vec![0, 0, 1, 1]);
}

#[test]
fn empty_cluster_keeps_its_centroid() {
    let mut engine = heap_engine(2, 3);
    let mut points = four_points();
    let far_away = 1.0e6_f64;
    let mut table = AggregateState::from_rows(1, vec![0.0, far_away, 9.0]).unwrap();
    engine.run(&KMeans::new(1, 3).unwrap(), &mut points, &mut table).unwrap();
    assert_eq!(table.row(0), &[0.5]);
    assert_eq!(table.row(1)[0].to_bits(), far_away.to_bits());
    assert_eq!(table.row(2), &[9.5]);
    assert_eq!(points.labels(), vec![0, 0, 2, 2]);
}

fn random_points(n: usize, dim: usize, seed: u64) -> PointBuffer {
    let mut rng = StdRng::seed_from_u64(seed);
    let coords = (0..n * dim).map(|_| rng.gen_range(-50.0..50.0)).collect::<Vec<f64>>();
    PointBuffer::from_coords(dim, &coords).unwrap()
}

#[test]
fn labels_do_not_depend_on_worker_counts() {
    let job = KMeans::new(3, 5).unwrap();
    let seed_points = random_points(500, 3, 11);
    let init = seed_centroids(InitStrategy::Sample, 5, &seed_points, &mut StdRng::seed_from_u64(3)).unwrap();

    let mut outcomes = vec![];
    for (maps, reds) in [(1, 1), (3, 2), (3, 2), (7, 5)] {
        let mut points = seed_points.clone();
        let mut table = init.clone();
        let mut engine = Engine::new(
            EngineConfig::new(maps, reds).with_block_capacity(128),
            HeapAllocator::new(1 << 20, Fit::Best).unwrap(),
        ).unwrap();
        engine.run(&job, &mut points, &mut table).unwrap();
        outcomes.push((points.labels(), table.into_inner()));
    }
    assert_eq!(outcomes[1], outcomes[2]);
    for (labels, centroids) in &outcomes[1..] {
        assert_eq!(labels, &outcomes[0].0);
        for (a, b) in centroids.iter().zip(&outcomes[0].1) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }
}

#[test]
fn iterations_release_blocks_between_runs() {
    let mut engine = heap_engine(2, 2);
    let mut points = random_points(200, 2, 5);
    let mut clustering = KMeans::new(2, 4).unwrap()
        .clustering(seed_centroids(InitStrategy::Uniform, 4, &points, &mut StdRng::seed_from_u64(9)).unwrap())
        .unwrap();
    let reports = clustering.iterate(&mut engine, &mut points, 10).unwrap();
    assert_eq!(reports.len(), 10);
    assert!(reports.iter().all(|r| r.records_emitted() == 200));
    assert_eq!(reports.iter().map(|r| r.iteration).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    assert_eq!(engine.state(), EngineState::Done);
    // Only the last iteration's blocks are still live.
    assert_eq!(engine.store().used_bytes(), 200 * points.layout().stride());
    engine.reset();
    assert_eq!(engine.allocator().stats().live_bytes, 0);

    let more = clustering.iterate(&mut engine, &mut points, 1).unwrap();
    assert_eq!(more[0].iteration, 10);
    assert_eq!(engine.completed_iterations(), 11);
}

#[test]
fn far_backend_matches_local_heap() {
    let mem = far_pool();
    let mut dataset = FarDataset::upload(mem.clone(), &four_points(), mem.config().block_bytes).unwrap();
    // 16-byte records, 32-byte blocks.
    assert_eq!(dataset.blocks().len(), 2);
    let mut engine = Engine::new(
        EngineConfig::new(2, 2).with_block_capacity(32),
        FarAllocator::new(mem.clone()),
    ).unwrap();
    let mut clustering = FarKMeans::new(1, 2).unwrap()
        .clustering(AggregateState::from_rows(1, vec![0.0, 9.0]).unwrap())
        .unwrap();
    clustering.iterate(&mut engine, &mut dataset, 1).unwrap();

    // Closing the run wrote everything back.
    assert_eq!(mem.stats().resident_bytes, 0);
    let (centroids, labels) = one_pass(2, 2);
    assert_eq!(clustering.centroids().as_slice(), centroids.as_slice());
    assert_eq!(dataset.download().unwrap().labels(), labels);
}

#[test]
fn far_dataset_with_tiny_cache_survives_eviction() {
    let cfg = FarConfig { cache_bytes: 64, far_bytes: 1 << 20, block_bytes: 48 };
    let mem = Arc::new(FarMemory::connect(cfg, "127.0.0.1:9001".parse().unwrap()).unwrap());
    let local = random_points(120, 2, 21);
    let init = seed_centroids(InitStrategy::Sample, 3, &local, &mut StdRng::seed_from_u64(2)).unwrap();

    let mut dataset = FarDataset::upload(mem.clone(), &local, 48).unwrap();
    let mut far_table = init.clone();
    let mut far_engine = Engine::new(
        EngineConfig::new(3, 2).with_block_capacity(48),
        FarAllocator::new(mem.clone()),
    ).unwrap();
    far_engine.run(&FarKMeans::new(2, 3).unwrap(), &mut dataset, &mut far_table).unwrap();
    assert!(mem.stats().evictions > 0);

    let mut points = local.clone();
    let mut table = init;
    heap_engine(3, 2).run(&KMeans::new(2, 3).unwrap(), &mut points, &mut table).unwrap();
    assert_eq!(far_table, table);
    assert_eq!(dataset.download().unwrap(), points);
}

#[test]
fn local_points_with_far_intermediates() {
    let mem = far_pool();
    let mut engine = Engine::new(EngineConfig::new(2, 1), FarAllocator::new(mem.clone())).unwrap();
    let mut points = four_points();
    let mut table = AggregateState::from_rows(1, vec![0.0, 9.0]).unwrap();
    engine.run(&KMeans::new(1, 2).unwrap(), &mut points, &mut table).unwrap();
    assert_eq!(table.as_slice(), &[0.5, 9.5]);
    drop(engine);
    assert_eq!(mem.stats().objects, 0);
}

#[test]
fn allocation_failure_ends_the_iteration() {
    // Too small for a single 512-byte block.
    let mut engine = Engine::new(EngineConfig::new(2, 2), HeapAllocator::new(256, Fit::First).unwrap()).unwrap();
    let mut points = four_points();
    let mut table = AggregateState::from_rows(1, vec![0.0, 9.0]).unwrap();
    let err = engine.run(&KMeans::new(1, 2).unwrap(), &mut points, &mut table).unwrap_err();
    assert!(matches!(err, MrError::AllocationFailure { requested: 512, .. }), "{err}");
    assert_ne!(engine.state(), EngineState::Done);
    assert_eq!(table.as_slice(), &[0.0, 9.0]);

    // A failed engine can be reset and reused.
    engine.reset();
    assert!(matches!(
        engine.run(&KMeans::new(1, 2).unwrap(), &mut points, &mut table),
        Err(MrError::AllocationFailure { .. })
    ));
}

#[test]
fn far_exhaustion_is_an_allocation_failure() {
    let cfg = FarConfig { cache_bytes: 4096, far_bytes: 100, block_bytes: 32 };
    let mem = Arc::new(FarMemory::connect(cfg, "127.0.0.1:9002".parse().unwrap()).unwrap());
    let mut engine = Engine::new(EngineConfig::new(1, 2), FarAllocator::new(mem)).unwrap();
    let mut points = four_points();
    let mut table = AggregateState::from_rows(1, vec![0.0, 9.0]).unwrap();
    let err = engine.run(&KMeans::new(1, 2).unwrap(), &mut points, &mut table).unwrap_err();
    assert!(matches!(err, MrError::AllocationFailure { .. }), "{err}");
}

#[test]
fn panicking_job_does_not_hang() {
    struct Explodes;

    impl<A: Allocator> Job<A> for Explodes {
        type Input = PointBuffer;
        type Value = f64;

        fn partition(&self, input: &PointBuffer, map_count: usize) -> Vec<Partition> {
            Partition::split_even(input.len(), input.layout().stride(), map_count)
        }

        fn map(&self, part: &mut [u8], _task: &mut MapTask<'_, A, f64>) -> Result<(), MrError> {
            if part.is_empty() {
                return Ok(());
            }
            panic!("boom");
        }

        fn reduce(&self, _task: &mut ReduceTask<'_, A, f64>) -> Result<(), MrError> {
            Ok(())
        }
    }

    let mut engine = heap_engine(3, 2);
    let mut table = AggregateState::new(2, 1, 0.0);
    let err = engine.run(&Explodes, &mut four_points(), &mut table).unwrap_err();
    assert!(matches!(err, MrError::WorkerPanic { role: "mapper", .. }), "{err}");
}

#[test]
fn bad_plan_is_rejected_before_any_work() {
    struct Greedy;

    impl<A: Allocator> Job<A> for Greedy {
        type Input = PointBuffer;
        type Value = f64;

        fn partition(&self, input: &PointBuffer, _map_count: usize) -> Vec<Partition> {
            vec![Partition::new(0, input.as_bytes().len())]
        }

        fn map(&self, _part: &mut [u8], _task: &mut MapTask<'_, A, f64>) -> Result<(), MrError> {
            unreachable!()
        }

        fn reduce(&self, _task: &mut ReduceTask<'_, A, f64>) -> Result<(), MrError> {
            unreachable!()
        }
    }

    let mut engine = heap_engine(2, 1);
    let mut table = AggregateState::new(1, 1, 0.0);
    let err = engine.run(&Greedy, &mut four_points(), &mut table).unwrap_err();
    assert!(matches!(err, MrError::Partition(_)));
    assert_eq!(engine.state(), EngineState::Idle);
}
