//! Lloyd's K-means as a [`Job`].
//!
//! The aggregate table holds one centroid per row. Mappers label each of
//! their points with the nearest centroid and route the labelled record to
//! the reducer owning that centroid's row. Reducers average the records
//! they receive, cluster by cluster, and overwrite their centroids with the
//! means. A cluster without points keeps its centroid.

mod far;
mod points;

pub use far::{FarDataset, FarExtent, FarKMeans, FarRun};
pub use points::{load_points, LoadReport, PointBuffer};

use rand::{seq::index, Rng};

use crate::helpe::*;

/// How the first centroids are picked.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default)]
pub enum InitStrategy {
    /// Every coordinate uniform in [0, 1)
    #[default]
    Uniform,
    /// Distinct points of the dataset
    Sample,
}

/// `means x dim` initial centroids.
pub fn seed_centroids(
    strategy:   InitStrategy,
    means:      usize,
    points:     &PointBuffer,
    rng:        &mut impl Rng,
) -> Result<AggregateState<f64>, MrError> {
    let dim = points.dim();
    let data = match strategy {
        InitStrategy::Uniform => (0..means * dim).map(|_| rng.gen::<f64>()).collect_vec(),
        InitStrategy::Sample => {
            if means > points.len() {
                return Err(MrError::Config(format!(
                    "cannot sample {} centroids from {} points", means, points.len()
                )));
            }
            index::sample(rng, points.len(), means)
                .into_iter()
                .flat_map(|idx| points.point(idx))
                .collect_vec()
        }
    };

    AggregateState::from_rows(dim, data)
}

/// Index of the centroid closest to `point` by squared Euclidean distance.
/// Ties go to the lower index.
#[inline(always)]
pub fn nearest(centroids: &[f64], dim: usize, point: &RecordMut<'_>) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (idx, c) in centroids.chunks_exact(dim).enumerate() {
        let dist: f64 = c.iter()
            .enumerate()
            .map(|(k, v)| {
                let d = point.value(k) - v;
                d * d
            })
            .sum();
        if dist < best_dist {
            best_dist = dist;
            best = idx;
        }
    }

    best
}

/// Labels every record of `bytes` and emits it to its centroid's owner.
pub(crate) fn assign_and_emit<A: Allocator>(
    layout: RecordLayout,
    bytes:  &mut [u8],
    task:   &mut MapTask<'_, A, f64>,
) -> Result<usize, MrError> {
    let mut records = layout.view_mut(bytes);
    let count = records.len();
    for idx in 0..count {
        let mut rec = records.get_mut(idx);
        let cluster = nearest(task.aggregate(), layout.dim(), &rec);
        rec.set_label(cluster as f64);
        task.emit(task.owner_of_row(cluster), rec.as_bytes())?;
    }

    Ok(count)
}

/// Replaces every owned centroid that received points with their mean.
pub(crate) fn average_owned<A: Allocator>(
    layout: RecordLayout,
    task:   &mut ReduceTask<'_, A, f64>,
) -> Result<(), MrError> {
    let owned = task.owned_range();
    if owned.is_empty() {
        trace!(reducer = task.id(), "no clusters owned");
        return Ok(());
    }
    let dim = layout.dim();
    let mut counts = vec![0u64; owned.len()];
    let mut sums = vec![0.0; owned.len() * dim];
    task.for_each_block(|bytes| {
        for rec in layout.view(bytes).iter() {
            let label = rec.label();
            if label.is_nan() || label < 0.0 {
                continue;
            }
            let cluster = label as usize;
            if !owned.contains(&cluster) {
                continue;
            }
            let local = cluster - owned.start;
            counts[local] += 1;
            for (k, s) in sums[local * dim..(local + 1) * dim].iter_mut().enumerate() {
                *s += rec.value(k);
            }
        }
    })?;

    task.consumed(counts.iter().sum::<u64>() as usize);
    let mut rows = task.owned_rows();
    for (local, &count) in counts.iter().enumerate().filter(|(_, c)| **c > 0) {
        let sum = &sums[local * dim..(local + 1) * dim];
        for (c, s) in rows.row_mut(owned.start + local).iter_mut().zip(sum) {
            *c = s / count as f64;
        }
    }
    trace!(reducer = task.id(), "centroids updated");

    Ok(())
}

/// K-means over points held in local memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeans {
    layout: RecordLayout,
    means:  usize,
}

impl KMeans {
    pub fn new(dim: usize, means: usize) -> Result<Self, MrError> {
        if dim == 0 {
            return Err(MrError::Config("dimensions must be > 0".into()));
        }
        if means == 0 {
            return Err(MrError::Config("number of means must be > 0".into()));
        }

        Ok(Self { layout: RecordLayout::new(dim), means })
    }

    pub fn dim(&self) -> usize {
        self.layout.dim()
    }

    pub fn means(&self) -> usize {
        self.means
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Checks that `centroids` is a `means x dim` table.
    pub fn check_centroids(&self, centroids: &AggregateState<f64>) -> Result<(), MrError> {
        if centroids.rows() != self.means || centroids.width() != self.dim() {
            return Err(MrError::Config(format!(
                "expected {}x{} centroids, got {}x{}",
                self.means, self.dim(), centroids.rows(), centroids.width()
            )));
        }

        Ok(())
    }

    pub fn clustering(self, centroids: AggregateState<f64>) -> Result<Clustering<KMeans>, MrError> {
        self.check_centroids(&centroids)?;
        Ok(Clustering { job: self, centroids })
    }
}

impl<A: Allocator> Job<A> for KMeans {
    type Input = PointBuffer;
    type Value = f64;

    fn partition(&self, input: &PointBuffer, map_count: usize) -> Vec<Partition> {
        Partition::split_even(input.len(), self.layout.stride(), map_count)
    }

    fn map(&self, part: &mut [u8], task: &mut MapTask<'_, A, f64>) -> Result<(), MrError> {
        assign_and_emit(self.layout, part, task)?;
        Ok(())
    }

    fn reduce(&self, task: &mut ReduceTask<'_, A, f64>) -> Result<(), MrError> {
        average_owned(self.layout, task)
    }
}

/// A K-means job together with the centroid table it refines.
#[derive(Debug, Clone)]
pub struct Clustering<J> {
    job:        J,
    centroids:  AggregateState<f64>,
}

impl<J> Clustering<J> {
    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn centroids(&self) -> &AggregateState<f64> {
        &self.centroids
    }

    pub fn into_centroids(self) -> AggregateState<f64> {
        self.centroids
    }

    pub fn iterate<A>(
        &mut self,
        engine:     &mut Engine<A>,
        input:      &mut J::Input,
        iterations: usize,
    ) -> Result<Vec<IterationReport>, MrError>
    where
        A: Allocator,
        J: Job<A, Value = f64>,
    {
        engine.run_iterations(&self.job, input, &mut self.centroids, iterations)
    }

    /// One line per centroid, coordinates with six decimals.
    pub fn render(&self) -> String {
        (0..self.centroids.rows())
            .map(|r| self.centroids.row(r).iter().map(|v| format!("{v:.6}")).join(" "))
            .join("\n")
    }
}
