use std::{
    cell::UnsafeCell,
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{alloc::Allocator, helpe::*};

/// Every extent starts at a multiple of this.
pub const HEAP_ALIGN: usize = 8;

static NEXT_ARENA: AtomicU64 = AtomicU64::new(1);

/// Gap search policy of the [`HeapAllocator`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default)]
pub enum Fit {
    /// First fit
    #[default]
    First,
    /// Best fit
    Best,
}

/// An extent of some [`HeapAllocator`]'s arena.
#[derive(Debug)]
pub struct HeapBlock {
    arena:  u64,
    offset: usize,
    len:    usize,
}

impl HeapBlock {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity:       usize,
    pub live_extents:   usize,
    pub live_bytes:     usize,
    /// Highest `live_bytes` since the last `init`.
    pub high_water:     usize,
    pub allocations:    u64,
    pub frees:          u64,
}

#[derive(Default)]
struct Extents {
    // offset -> aligned size
    live:           BTreeMap<usize, usize>,
    live_bytes:     usize,
    high_water:     usize,
    allocations:    u64,
    frees:          u64,
}

/// A fixed-capacity arena carved into extents by first- or best-fit gap
/// search. There is no compaction: an extent never moves while it is live.
pub struct HeapAllocator {
    id:         u64,
    capacity:   usize,
    fit:        Fit,
    arena:      Box<[UnsafeCell<u8>]>,
    extents:    Mutex<Extents>,
}

// SAFETY: arena bytes are only reached through `scoped`/`scoped_mut`, which
// require a handle to a live extent. Live extents never overlap and each
// has exactly one (move-only) handle.
unsafe impl Sync for HeapAllocator {}

impl HeapAllocator {
    /// Fails with [`MrError::AllocationFailure`] if the process cannot get
    /// `capacity` bytes for the arena.
    pub fn new(capacity: usize, fit: Fit) -> Result<Self, MrError> {
        let mut zeroed = Vec::new();
        zeroed.try_reserve_exact(capacity)
            .map_err(|e| MrError::AllocationFailure {
                requested:  capacity,
                reason:     format!("cannot set up heap arena: {e}"),
            })?;
        zeroed.resize(capacity, 0u8);
        // SAFETY: `UnsafeCell<u8>` has the same layout as `u8`.
        let arena = unsafe { Box::from_raw(Box::into_raw(zeroed.into_boxed_slice()) as *mut [UnsafeCell<u8>]) };

        Ok(Self {
            id: NEXT_ARENA.fetch_add(1, Ordering::Relaxed),
            capacity,
            fit,
            arena,
            extents: Mutex::new(Extents::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fit(&self) -> Fit {
        self.fit
    }

    pub fn stats(&self) -> HeapStats {
        let ext = lock(&self.extents);
        HeapStats {
            capacity:       self.capacity,
            live_extents:   ext.live.len(),
            live_bytes:     ext.live_bytes,
            high_water:     ext.high_water,
            allocations:    ext.allocations,
            frees:          ext.frees,
        }
    }

    /// Walks live extents in ascending offset, looking for a gap of at
    /// least `size` bytes. First fit stops at the first such gap, best fit
    /// keeps the smallest one.
    fn find_gap(&self, live: &BTreeMap<usize, usize>, size: usize) -> Option<usize> {
        let mut offset_runner = 0;
        let mut smallest_gap = usize::MAX;
        let mut best_offset: Option<usize> = None;
        let tail = (self.capacity, 0);
        for (&off, &len) in live.iter().chain(std::iter::once((&tail.0, &tail.1))) {
            if off > offset_runner && off - offset_runner >= size {
                let gap = off - offset_runner;
                if let Fit::Best = self.fit {
                    if gap < smallest_gap {
                        smallest_gap = gap;
                        best_offset = Some(offset_runner);
                    }
                } else {
                    return Some(offset_runner);
                }
            }
            offset_runner = offset_runner.max(off + len);
        }

        best_offset
    }

    #[inline(always)]
    fn check(&self, handle: &HeapBlock) -> Result<(), MrError> {
        if handle.arena != self.id || handle.offset + handle.len > self.capacity {
            return Err(MrError::ForeignHandle);
        }
        Ok(())
    }

    #[inline(always)]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.arena.as_ptr())
    }
}

impl Allocator for HeapAllocator {
    type Handle = HeapBlock;

    fn init(&self) -> Result<(), MrError> {
        let mut ext = lock(&self.extents);
        ext.high_water = ext.live_bytes;
        ext.allocations = 0;
        ext.frees = 0;
        debug!(arena = self.id, capacity = self.capacity, live = ext.live_bytes, "heap ready");

        Ok(())
    }

    fn allocate(&self, size: usize) -> Result<HeapBlock, MrError> {
        let aligned = size.max(1)
            .checked_next_multiple_of(HEAP_ALIGN)
            .ok_or_else(|| MrError::AllocationFailure {
                requested:  size,
                reason:     "size overflows the address space".into(),
            })?;
        let mut ext = lock(&self.extents);
        let offset = self.find_gap(&ext.live, aligned)
            .ok_or_else(|| MrError::AllocationFailure {
                requested:  size,
                reason:     format!(
                    "no {}-byte gap left in a {}-byte arena ({} bytes live)",
                    aligned, self.capacity, ext.live_bytes
                ),
            })?;
        ext.live.insert(offset, aligned);
        ext.live_bytes += aligned;
        ext.high_water = ext.high_water.max(ext.live_bytes);
        ext.allocations += 1;
        trace!(arena = self.id, offset, size, "allocated");

        Ok(HeapBlock { arena: self.id, offset, len: size })
    }

    fn deallocate(&self, handle: HeapBlock) {
        if handle.arena != self.id {
            debug!(arena = self.id, foreign = handle.arena, "ignoring foreign block");
            return;
        }
        let mut ext = lock(&self.extents);
        if let Some(aligned) = ext.live.remove(&handle.offset) {
            ext.live_bytes -= aligned;
            ext.frees += 1;
        }
    }

    fn shutdown(&self) -> Result<(), MrError> {
        let stats = self.stats();
        debug!(
            arena = self.id,
            allocations = stats.allocations,
            frees = stats.frees,
            live = stats.live_bytes,
            high_water = stats.high_water,
            "heap iteration closed"
        );

        Ok(())
    }

    fn scoped<R>(&self, handle: &HeapBlock, f: impl FnOnce(&[u8]) -> R) -> Result<R, MrError> {
        self.check(handle)?;
        // SAFETY: the extent is live and in bounds. Writers need `&mut` to
        // its only handle, which we hold shared for the whole call.
        let bytes = unsafe { std::slice::from_raw_parts(self.base().add(handle.offset), handle.len) };

        Ok(f(bytes))
    }

    fn scoped_mut<R>(
        &self,
        handle: &mut HeapBlock,
        f:      impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MrError> {
        self.check(handle)?;
        // SAFETY: as above, and the handle is borrowed exclusively.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.base().add(handle.offset), handle.len) };

        Ok(f(bytes))
    }
}

/// An arena size that comfortably holds one iteration's intermediate data
/// for a dataset of `dataset_bytes`: every record once, plus one partially
/// filled block per cell. Sizes that do not fit a `usize` are a
/// configuration error.
pub fn suggested_capacity(dataset_bytes: usize, cfg: &EngineConfig) -> Result<usize, MrError> {
    let slack = cfg.map_tasks
        .checked_mul(cfg.reduce_tasks)
        .zip(cfg.block_capacity.checked_next_multiple_of(HEAP_ALIGN))
        .and_then(|(cells, block)| cells.checked_mul(block));
    let total = slack
        .and_then(|s| s.checked_mul(2))
        .zip(dataset_bytes.checked_mul(2))
        .and_then(|(s, d)| s.checked_add(d))
        .and_then(|t| t.checked_add(1 << 20));

    total.ok_or_else(|| MrError::Config(format!(
        "heap size for {} dataset bytes and {}-byte blocks overflows",
        dataset_bytes, cfg.block_capacity
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_and_best_fit_pick_different_gaps() {
        for (fit, expected) in [(Fit::First, 0), (Fit::Best, 64)] {
            let heap = HeapAllocator::new(80, fit).unwrap();
            let a = heap.allocate(32).unwrap();
            let _b = heap.allocate(16).unwrap();
            let _c = heap.allocate(16).unwrap();
            heap.deallocate(a);
            // Gaps now: [0, 32) and [64, 80).
            let d = heap.allocate(16).unwrap();
            assert_eq!(d.offset(), expected, "{fit:?}");
        }
    }

    #[test]
    fn extents_are_aligned() {
        let heap = HeapAllocator::new(64, Fit::First).unwrap();
        let a = heap.allocate(3).unwrap();
        let b = heap.allocate(9).unwrap();
        let c = heap.allocate(0).unwrap();
        assert_eq!((a.offset(), b.offset(), c.offset()), (0, 8, 24));
        assert_eq!((a.len(), b.len()), (3, 9));
        assert!(c.is_empty());
    }

    #[test]
    fn exhaustion_is_an_allocation_failure() {
        let heap = HeapAllocator::new(64, Fit::First).unwrap();
        let a = heap.allocate(48).unwrap();
        let err = heap.allocate(24).unwrap_err();
        assert!(matches!(err, MrError::AllocationFailure { requested: 24, .. }));
        heap.deallocate(a);
        assert!(heap.allocate(24).is_ok());
    }

    #[test]
    fn extents_do_not_move_or_bleed() {
        let heap = HeapAllocator::new(256, Fit::Best).unwrap();
        let mut a = heap.allocate(16).unwrap();
        let mid = heap.allocate(16).unwrap();
        let mut c = heap.allocate(16).unwrap();
        heap.scoped_mut(&mut a, |b| b.fill(0xaa)).unwrap();
        heap.scoped_mut(&mut c, |b| b.fill(0xcc)).unwrap();
        heap.deallocate(mid);
        let mut d = heap.allocate(8).unwrap();
        heap.scoped_mut(&mut d, |b| b.fill(0xdd)).unwrap();

        assert_eq!(c.offset(), 32);
        assert!(heap.scoped(&a, |b| b.iter().all(|&x| x == 0xaa)).unwrap());
        assert!(heap.scoped(&c, |b| b.iter().all(|&x| x == 0xcc)).unwrap());
        let stats = heap.stats();
        assert_eq!(stats.live_extents, 3);
        assert_eq!(stats.live_bytes, 40);
        assert_eq!(stats.high_water, 48);
    }

    #[test]
    fn foreign_blocks_are_rejected() {
        let one = HeapAllocator::new(64, Fit::First).unwrap();
        let other = HeapAllocator::new(64, Fit::First).unwrap();
        let mut block = one.allocate(8).unwrap();
        assert!(matches!(other.scoped_mut(&mut block, |_| ()), Err(MrError::ForeignHandle)));
        other.deallocate(block);
        assert_eq!(one.stats().live_extents, 1);
    }

    #[test]
    fn unattainable_arena_is_an_allocation_failure() {
        let err = HeapAllocator::new(usize::MAX, Fit::First).err().unwrap();
        assert!(matches!(err, MrError::AllocationFailure { requested: usize::MAX, .. }), "{err}");
    }

    #[test]
    fn oversized_request_fails_instead_of_overflowing() {
        let heap = HeapAllocator::new(64, Fit::First).unwrap();
        assert!(matches!(heap.allocate(usize::MAX), Err(MrError::AllocationFailure { requested: usize::MAX, .. })));
        assert!(matches!(heap.allocate(usize::MAX - 3), Err(MrError::AllocationFailure { .. })));
        assert_eq!(heap.stats().live_extents, 0);
    }

    #[test]
    fn suggested_capacity_rejects_overflowing_sizes() {
        let cfg = EngineConfig::new(2, 2);
        assert_eq!(suggested_capacity(100, &cfg).unwrap(), 200 + 2 * 4 * 512 + (1 << 20));
        let huge_blocks = EngineConfig::new(1, 1).with_block_capacity(usize::MAX);
        assert!(matches!(suggested_capacity(100, &huge_blocks), Err(MrError::Config(_))));
        let many_cells = EngineConfig::new(usize::MAX, 2);
        assert!(matches!(suggested_capacity(100, &many_cells), Err(MrError::Config(_))));
        assert!(matches!(suggested_capacity(usize::MAX, &cfg), Err(MrError::Config(_))));
    }

    #[test]
    fn handles_survive_shutdown() {
        let heap = HeapAllocator::new(64, Fit::First).unwrap();
        heap.init().unwrap();
        let mut a = heap.allocate(8).unwrap();
        heap.scoped_mut(&mut a, |b| b.copy_from_slice(&7u64.to_ne_bytes())).unwrap();
        heap.shutdown().unwrap();
        assert_eq!(heap.scoped(&a, |b| b.to_vec()).unwrap(), 7u64.to_ne_bytes());
        heap.deallocate(a);
        assert_eq!(heap.stats().live_bytes, 0);
    }
}
