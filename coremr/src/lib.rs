//! Welcome to `coremr`!
//!
//! A small, embeddable MapReduce engine. One iteration partitions an input
//! across `M` mapper threads, routes every emitted record into the
//! intermediate cell `(mapper, reducer)`, and lets `R` reducer threads fold
//! their column of cells into a shared, row-partitioned aggregate table.
//! Two rendezvous points keep the phases apart:
//!
//! 1. `map_done` counts **every** worker, mappers *and* reducers. A reducer
//!     arrives as soon as it starts, so nobody reads a cell before all
//!     mappers are finished and all reducers are parked.
//! 2. `reduce_done` counts reducers only and closes the iteration.
//!
//! Memory for intermediate data comes from a pluggable [`Allocator`]: the
//! local [`HeapAllocator`] arena, or [`FarAllocator`] on top of a
//! disaggregated [`farmem::FarMemory`] pool.

mod aggregate;
mod engine;
mod partition;
mod phase;
mod record;
mod store;

pub mod alloc;
pub mod cli;
pub mod helpe;
pub mod kmeans;

pub use crate::helpe::*;

/// Our fundamental unit of interest. A [`Job`] is the domain logic that
/// the [`Engine`] drives:
///
/// 1. [`partition`](Job::partition) cuts the input into one contiguous
///     range per mapper,
/// 2. [`map`](Job::map) runs once per range and emits records through its
///     [`MapTask`],
/// 3. [`reduce`](Job::reduce) runs once per reducer and folds the records
///     addressed to it into its own rows of the aggregate table.
///
/// The engine only borrows a job for the duration of a run. Jobs are
/// `Sync` because every worker thread calls into the same instance.
pub trait Job<A: Allocator>: Sync {
    /// What gets partitioned.
    type Input: Splittable;
    /// Element type of the shared aggregate table.
    type Value: Copy + Send + Sync;

    /// Returns exactly `map_count` ranges which tile `input` in order.
    fn partition(&self, input: &Self::Input, map_count: usize) -> Vec<Partition>;

    fn map(
        &self,
        part: <Self::Input as Splittable>::Part<'_>,
        task: &mut MapTask<'_, A, Self::Value>,
    ) -> Result<(), MrError>;

    fn reduce(&self, task: &mut ReduceTask<'_, A, Self::Value>) -> Result<(), MrError>;
}

/// A half-open range `[offset, offset + len)` of input units assigned to
/// exactly one mapper. A unit is whatever the [`Splittable`] input counts
/// in: bytes for a flat buffer, blocks for a far-memory dataset.
///
/// > ***ATTENTION:*** the ranges of one plan must be contiguous, in mapper
/// > order, and cover the whole input. Empty ranges are fine; a mapper
/// > handed one simply emits nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Partition {
    pub offset: usize,
    pub len:    usize,
}
