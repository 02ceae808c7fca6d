pub use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
pub use thiserror::Error;
pub use itertools::Itertools;
pub use rayon::prelude::*;
pub use clap::{Parser, ValueEnum};
pub use tracing::{debug, info, trace, warn};

pub use crate::{Job, Partition,
    aggregate::*,
    alloc::{suggested_capacity, Allocator, FarAllocator, Fit, HeapAllocator, HeapBlock, HeapStats},
    engine::*,
    partition::*,
    phase::*,
    record::*,
    store::*,
};

/// Size of one packed value in a record.
pub const VALUE_BYTES: usize = std::mem::size_of::<f64>();

#[derive(Error, Debug)]
pub enum MrError {
    /// Missing or malformed parameters. Raised before any work starts.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// One input line has the wrong number of values. The loader recovers
    /// from this locally; it never escapes a successful load.
    #[error("line {line}: expected {expected} values, got {got}")]
    DataFormat {
        line:       usize,
        expected:   usize,
        got:        usize,
    },
    #[error("no valid data points were loaded from {0}")]
    EmptyDataset(PathBuf),
    #[error("failed to allocate {requested} bytes: {reason}")]
    AllocationFailure {
        requested:  usize,
        reason:     String,
    },
    #[error("handle does not belong to this allocator")]
    ForeignHandle,
    #[error("remote memory failure: {0}")]
    Remote(#[source] farmem::FarError),
    #[error("bad partition plan: {0}")]
    Partition(String),
    #[error("record routed to reducer {reducer}, but only {reducers} exist")]
    BadRoute {
        reducer:    usize,
        reducers:   usize,
    },
    #[error("engine holds data of a previous iteration, reset it first")]
    NotReset,
    #[error("iteration aborted by a failing sibling worker")]
    Aborted,
    #[error("{role} worker {id} panicked")]
    WorkerPanic {
        role:   &'static str,
        id:     usize,
    },
    #[error("cannot spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<farmem::FarError> for MrError {
    fn from(e: farmem::FarError) -> Self {
        match e {
            farmem::FarError::Exhausted { requested, .. } => MrError::AllocationFailure {
                requested,
                reason: e.to_string(),
            },
            other => MrError::Remote(other),
        }
    }
}

#[inline(always)]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Nothing panics while holding our locks; a poisoned one is still consistent.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
