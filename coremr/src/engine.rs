use std::thread;

use crate::helpe::*;

/// Default capacity of an intermediate block, in bytes.
pub const DEFAULT_BLOCK_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub map_tasks:      usize,
    pub reduce_tasks:   usize,
    /// Minimum size of every block allocated for intermediate data.
    pub block_capacity: usize,
}

impl EngineConfig {
    pub fn new(map_tasks: usize, reduce_tasks: usize) -> Self {
        Self { map_tasks, reduce_tasks, block_capacity: DEFAULT_BLOCK_CAPACITY }
    }

    pub fn with_block_capacity(mut self, block_capacity: usize) -> Self {
        self.block_capacity = block_capacity;
        self
    }

    pub fn validate(&self) -> Result<(), MrError> {
        if self.map_tasks == 0 {
            return Err(MrError::Config("map task count must be > 0".into()));
        }
        if self.reduce_tasks == 0 {
            return Err(MrError::Config("reduce task count must be > 0".into()));
        }
        if self.block_capacity == 0 {
            return Err(MrError::Config("block capacity must be > 0".into()));
        }

        Ok(())
    }
}

/// Where an [`Engine`] is within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Fresh, or reset. Ready to run.
    Idle,
    Partitioned,
    MapRunning,
    ReduceRunning,
    /// The iteration completed. Intermediate data is still around.
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    pub records:    usize,
    pub bytes:      usize,
    pub blocks:     usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceStats {
    pub blocks:     usize,
    pub bytes:      usize,
    /// As reported by the job through [`ReduceTask::consumed`].
    pub records:    usize,
}

/// What one call to [`Engine::run`] did.
#[derive(Debug, Clone)]
pub struct IterationReport {
    /// Zero-based count of completed iterations before this one.
    pub iteration:  u64,
    pub map:        Vec<MapStats>,
    pub reduce:     Vec<ReduceStats>,
    pub elapsed:    Duration,
}

impl IterationReport {
    pub fn records_emitted(&self) -> usize {
        self.map.iter().map(|s| s.records).sum()
    }

    pub fn bytes_emitted(&self) -> usize {
        self.map.iter().map(|s| s.bytes).sum()
    }

    pub fn blocks_allocated(&self) -> usize {
        self.map.iter().map(|s| s.blocks).sum()
    }

    pub fn records_reduced(&self) -> usize {
        self.reduce.iter().map(|s| s.records).sum()
    }
}

/// The mapper-side context of one iteration.
pub struct MapTask<'a, A: Allocator, T> {
    id:             usize,
    lane:           MapLane<'a, A::Handle>,
    alloc:          &'a A,
    block_capacity: usize,
    reducers:       usize,
    aggregate:      SharedAggregate<'a, T>,
    stats:          MapStats,
}

impl<'a, A: Allocator, T> MapTask<'a, A, T> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn reduce_count(&self) -> usize {
        self.reducers
    }

    pub fn allocator(&self) -> &A {
        self.alloc
    }

    /// The whole aggregate table, row-major.
    pub fn aggregate(&self) -> &[T] {
        // SAFETY: reducers only write after the map rendezvous, which this
        // task's mapper reaches after the task is gone.
        unsafe { self.aggregate.table() }
    }

    pub fn aggregate_rows(&self) -> usize {
        self.aggregate.rows()
    }

    /// The reducer responsible for aggregate row `row`.
    pub fn owner_of_row(&self, row: usize) -> usize {
        owner_of(row, self.reducers, self.aggregate.rows())
    }

    /// Appends `record` to cell `(self.id(), reducer)`.
    pub fn emit(&mut self, reducer: usize, record: &[u8]) -> Result<(), MrError> {
        if reducer >= self.reducers {
            return Err(MrError::BadRoute { reducer, reducers: self.reducers });
        }
        let spill = self.lane
            .cell_mut(reducer)
            .emit(self.alloc, self.block_capacity, record)?;
        if let Spill::NewBlock { capacity } = spill {
            trace!(mapper = self.id, reducer, capacity, "new intermediate block");
            self.stats.blocks += 1;
        }
        self.stats.records += 1;
        self.stats.bytes += record.len();

        Ok(())
    }

    pub fn stats(&self) -> MapStats {
        self.stats
    }

    fn finish(self) -> MapStats {
        self.stats
    }
}

/// The reducer-side context of one iteration.
pub struct ReduceTask<'a, A: Allocator, T> {
    id:         usize,
    lane:       ReduceLane<'a, A::Handle>,
    proof:      MapPhaseComplete,
    alloc:      &'a A,
    mappers:    usize,
    owned:      Range<usize>,
    aggregate:  SharedAggregate<'a, T>,
    stats:      ReduceStats,
}

impl<'a, A: Allocator, T> ReduceTask<'a, A, T> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn map_count(&self) -> usize {
        self.mappers
    }

    pub fn allocator(&self) -> &A {
        self.alloc
    }

    pub fn aggregate_rows(&self) -> usize {
        self.aggregate.rows()
    }

    /// Aggregate rows this reducer may write.
    pub fn owned_range(&self) -> Range<usize> {
        self.owned.clone()
    }

    /// Feeds `f` every block addressed to this reducer: cells in mapper
    /// order, blocks in emission order, only the filled prefix of each.
    pub fn for_each_block(&mut self, mut f: impl FnMut(&[u8])) -> Result<(), MrError> {
        let stats = &mut self.stats;
        for cell in self.lane.cells(&self.proof) {
            cell.for_each_block(self.alloc, |bytes| {
                stats.blocks += 1;
                stats.bytes += bytes.len();
                f(bytes)
            })?;
        }

        Ok(())
    }

    /// Tells the engine how many records this reducer folded.
    pub fn consumed(&mut self, records: usize) {
        self.stats.records += records;
    }

    pub fn owned_rows(&mut self) -> OwnedRows<'_, T> {
        let width = self.aggregate.width();
        // SAFETY: the map phase is over, so nobody reads the whole table,
        // and owned ranges of distinct reducers are disjoint.
        let data = unsafe { self.aggregate.rows_mut(self.owned.clone()) };
        OwnedRows::new(self.owned.clone(), width, data)
    }

    pub fn stats(&self) -> ReduceStats {
        self.stats
    }

    fn finish(self) -> (ReduceStats, MapPhaseComplete) {
        (self.stats, self.proof)
    }
}

/// Drives [`Job`]s over `M` mapper and `R` reducer threads, storing
/// intermediate data in blocks of an [`Allocator`].
///
/// One [`Engine::run`] is one iteration:
///
/// ```text
///   Idle -> Partitioned -> MapRunning -> ReduceRunning -> Done
/// ```
///
/// A `Done` (or failed) engine must be [`reset`](Engine::reset) before it
/// can run again.
pub struct Engine<A: Allocator> {
    cfg:        EngineConfig,
    alloc:      A,
    store:      IntermediateStore<A::Handle>,
    sync:       PhaseSync,
    state:      EngineState,
    completed:  u64,
}

impl<A: Allocator> Engine<A> {
    pub fn new(cfg: EngineConfig, alloc: A) -> Result<Self, MrError> {
        cfg.validate()?;
        info!(
            mappers = cfg.map_tasks,
            reducers = cfg.reduce_tasks,
            block_capacity = cfg.block_capacity,
            "engine ready"
        );

        Ok(Self {
            cfg,
            alloc,
            store:      IntermediateStore::new(cfg.map_tasks, cfg.reduce_tasks),
            sync:       PhaseSync::new(cfg.map_tasks, cfg.reduce_tasks),
            state:      EngineState::Idle,
            completed:  0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn store(&self) -> &IntermediateStore<A::Handle> {
        &self.store
    }

    pub fn completed_iterations(&self) -> u64 {
        self.completed
    }

    /// Gives every intermediate block back and returns to `Idle`.
    pub fn reset(&mut self) {
        let blocks = self.store.total_blocks();
        self.store.reset(&self.alloc);
        self.state = EngineState::Idle;
        debug!(blocks, "engine reset");
    }

    /// Runs one iteration of `job`. `state` is read by mappers and updated
    /// by reducers in place.
    pub fn run<J>(
        &mut self,
        job:    &J,
        input:  &mut J::Input,
        state:  &mut AggregateState<J::Value>,
    ) -> Result<IterationReport, MrError>
    where
        J: Job<A>,
    {
        if self.state != EngineState::Idle {
            return Err(MrError::NotReset);
        }
        let started = Instant::now();
        self.alloc.init()?;
        let outcome = self.run_phases(job, input, state);
        let closed = self.alloc.shutdown();
        let (map, reduce) = outcome?;
        closed?;

        self.state = EngineState::Done;
        let report = IterationReport {
            iteration:  self.completed,
            map,
            reduce,
            elapsed:    started.elapsed(),
        };
        self.completed += 1;
        info!(
            iteration = report.iteration,
            records = report.records_emitted(),
            blocks = report.blocks_allocated(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "iteration done"
        );

        Ok(report)
    }

    /// Runs `iterations` iterations back to back, resetting in between.
    /// Intermediate data of the last one is kept until the next reset.
    pub fn run_iterations<J>(
        &mut self,
        job:        &J,
        input:      &mut J::Input,
        state:      &mut AggregateState<J::Value>,
        iterations: usize,
    ) -> Result<Vec<IterationReport>, MrError>
    where
        J: Job<A>,
    {
        let mut reports = Vec::with_capacity(iterations);
        for _ in 0..iterations {
            if self.state != EngineState::Idle {
                self.reset();
            }
            reports.push(self.run(job, input, state)?);
        }

        Ok(reports)
    }

    fn run_phases<J>(
        &mut self,
        job:    &J,
        input:  &mut J::Input,
        state:  &mut AggregateState<J::Value>,
    ) -> Result<(Vec<MapStats>, Vec<ReduceStats>), MrError>
    where
        J: Job<A>,
    {
        let cfg = self.cfg;
        let plan = job.partition(input, cfg.map_tasks);
        check_plan(&plan, input.units(), cfg.map_tasks)?;
        debug!(plan = ?plan.iter().map(Partition::range).collect_vec(), "partitioned");
        self.state = EngineState::Partitioned;

        let parts = input.split(&plan);
        let rows = state.rows();
        let shared = state.share();
        self.sync.rearm();
        let sync = &self.sync;
        let alloc = &self.alloc;
        let phase = &mut self.state;
        let (map_lanes, reduce_lanes) = self.store.lanes();

        thread::scope(|s| {
            let mut failure: Option<MrError> = None;
            let mut mappers = Vec::with_capacity(cfg.map_tasks);
            let mut reducers = Vec::with_capacity(cfg.reduce_tasks);

            *phase = EngineState::MapRunning;
            for (id, (part, lane)) in parts.into_iter().zip(map_lanes).enumerate() {
                let task = MapTask {
                    id,
                    lane,
                    alloc,
                    block_capacity: cfg.block_capacity,
                    reducers:       cfg.reduce_tasks,
                    aggregate:      shared,
                    stats:          MapStats::default(),
                };
                match thread::Builder::new()
                    .name(format!("mapper-{id}"))
                    .spawn_scoped(s, move || map_worker(job, part, task, sync)) {
                    Ok(h) => mappers.push(h),
                    Err(e) => {
                        keep_first(&mut failure, MrError::Spawn(e));
                        break;
                    }
                }
            }
            if failure.is_none() {
                for (id, lane) in reduce_lanes.into_iter().enumerate() {
                    let owned = owned_rows(id, cfg.reduce_tasks, rows);
                    match thread::Builder::new()
                        .name(format!("reducer-{id}"))
                        .spawn_scoped(s, move || {
                            reduce_worker(job, id, lane, alloc, cfg.map_tasks, owned, shared, sync)
                        }) {
                        Ok(h) => reducers.push(h),
                        Err(e) => {
                            keep_first(&mut failure, MrError::Spawn(e));
                            break;
                        }
                    }
                }
            }
            if failure.is_some() {
                sync.abort();
            }

            let mut map_stats = Vec::with_capacity(cfg.map_tasks);
            for (id, h) in mappers.into_iter().enumerate() {
                match h.join().unwrap_or(Err(MrError::WorkerPanic { role: "mapper", id })) {
                    Ok(st) => map_stats.push(st),
                    Err(e) => keep_first(&mut failure, e),
                }
            }
            if failure.is_none() {
                *phase = EngineState::ReduceRunning;
            }
            let mut reduce_stats = Vec::with_capacity(cfg.reduce_tasks);
            for (id, h) in reducers.into_iter().enumerate() {
                match h.join().unwrap_or(Err(MrError::WorkerPanic { role: "reducer", id })) {
                    Ok(st) => reduce_stats.push(st),
                    Err(e) => keep_first(&mut failure, e),
                }
            }

            match failure {
                Some(e) => Err(e),
                None => Ok((map_stats, reduce_stats)),
            }
        })
    }
}

impl<A: Allocator> Drop for Engine<A> {
    fn drop(&mut self) {
        self.store.reset(&self.alloc);
    }
}

/// The first real failure wins over the `Aborted`s it caused in siblings.
fn keep_first(slot: &mut Option<MrError>, e: MrError) {
    match slot {
        None => *slot = Some(e),
        Some(MrError::Aborted) if !matches!(e, MrError::Aborted) => *slot = Some(e),
        _ => {}
    }
}

fn map_worker<'p, A, J>(
    job:        &J,
    part:       <J::Input as Splittable>::Part<'p>,
    mut task:   MapTask<'_, A, J::Value>,
    sync:       &PhaseSync,
) -> Result<MapStats, MrError>
where
    A: Allocator,
    J: Job<A>,
{
    // Armed until a clean arrival, so failures and panics release siblings.
    let guard = sync.abort_on_drop();
    let started = Instant::now();
    let id = task.id();
    let outcome = job.map(part, &mut task);
    let stats = task.finish();
    match outcome {
        Ok(()) => {
            debug!(
                mapper = id,
                records = stats.records,
                blocks = stats.blocks,
                elapsed_us = started.elapsed().as_micros() as u64,
                "map done"
            );
            sync.mapper_done()?;
            guard.disarm();
            Ok(stats)
        }
        Err(e) => {
            warn!(mapper = id, error = %e, "map failed");
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn reduce_worker<A, J>(
    job:        &J,
    id:         usize,
    lane:       ReduceLane<'_, A::Handle>,
    alloc:      &A,
    mappers:    usize,
    owned:      Range<usize>,
    aggregate:  SharedAggregate<'_, J::Value>,
    sync:       &PhaseSync,
) -> Result<ReduceStats, MrError>
where
    A: Allocator,
    J: Job<A>,
{
    let guard = sync.abort_on_drop();
    // Arrive first; no cell may be touched before the map phase is over.
    let proof = sync.reducer_ready()?;
    let started = Instant::now();
    let mut task = ReduceTask {
        id,
        lane,
        proof,
        alloc,
        mappers,
        owned,
        aggregate,
        stats: ReduceStats::default(),
    };
    if let Err(e) = job.reduce(&mut task) {
        warn!(reducer = id, error = %e, "reduce failed");
        return Err(e);
    }
    let (stats, proof) = task.finish();
    debug!(
        reducer = id,
        blocks = stats.blocks,
        bytes = stats.bytes,
        elapsed_us = started.elapsed().as_micros() as u64,
        "reduce done"
    );
    sync.reducer_done(proof)?;
    guard.disarm();

    Ok(stats)
}
