use std::cell::UnsafeCell;

use crate::helpe::*;

/// One allocator block of an intermediate cell. Only `[0, used)` holds
/// records.
#[derive(Debug)]
pub struct Block<H> {
    handle:     H,
    capacity:   usize,
    used:       usize,
}

impl<H> Block<H> {
    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

/// Did an [`IntermediateCell::emit`] have to grab a new block?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spill {
    InPlace,
    NewBlock { capacity: usize },
}

/// Everything one mapper has emitted for one reducer, in emission order.
#[derive(Debug)]
pub struct IntermediateCell<H> {
    blocks: Vec<Block<H>>,
}

impl<H> Default for IntermediateCell<H> {
    fn default() -> Self {
        Self { blocks: vec![] }
    }
}

impl<H> IntermediateCell<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> &[Block<H>] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.blocks.iter().map(Block::used).sum()
    }

    /// Appends `record` to the last block if it fits there. Otherwise a new
    /// block of `max(record.len(), block_capacity)` bytes is allocated and
    /// becomes the last one. Records are never split across blocks.
    pub fn emit<A>(&mut self, alloc: &A, block_capacity: usize, record: &[u8]) -> Result<Spill, MrError>
    where
        A: Allocator<Handle = H>,
    {
        let len = record.len();
        if let Some(last) = self.blocks.last_mut() {
            if last.remaining() >= len {
                let at = last.used;
                alloc.scoped_mut(&mut last.handle, |bytes| bytes[at..at + len].copy_from_slice(record))?;
                last.used += len;
                return Ok(Spill::InPlace);
            }
        }

        let capacity = len.max(block_capacity);
        let mut handle = alloc.allocate(capacity)?;
        if let Err(e) = alloc.scoped_mut(&mut handle, |bytes| bytes[..len].copy_from_slice(record)) {
            alloc.deallocate(handle);
            return Err(e);
        }
        self.blocks.push(Block { handle, capacity, used: len });

        Ok(Spill::NewBlock { capacity })
    }

    /// Calls `f` on the filled prefix of every block, in insertion order,
    /// each inside its own scoped binding.
    pub fn for_each_block<A>(&self, alloc: &A, mut f: impl FnMut(&[u8])) -> Result<(), MrError>
    where
        A: Allocator<Handle = H>,
    {
        for b in &self.blocks {
            alloc.scoped(&b.handle, |bytes| f(&bytes[..b.used]))?;
        }

        Ok(())
    }

    pub fn release<A>(&mut self, alloc: &A)
    where
        A: Allocator<Handle = H>,
    {
        for b in self.blocks.drain(..) {
            alloc.deallocate(b.handle);
        }
    }
}

/// The `M x R` grid of intermediate cells. Cell `(m, r)` is written only by
/// mapper `m` during the map phase and read only by reducer `r` during the
/// reduce phase.
pub struct IntermediateStore<H> {
    map_count:      usize,
    reduce_count:   usize,
    cells:          Box<[UnsafeCell<IntermediateCell<H>>]>,
}

// SAFETY: shared access to cells goes through `MapLane`/`ReduceLane` only,
// and those follow the single-writer-then-readers protocol described on
// `IntermediateStore::lanes`.
unsafe impl<H: Send + Sync> Sync for IntermediateStore<H> {}

impl<H> IntermediateStore<H> {
    pub fn new(map_count: usize, reduce_count: usize) -> Self {
        Self {
            map_count,
            reduce_count,
            cells: (0..map_count * reduce_count)
                .map(|_| UnsafeCell::new(IntermediateCell::new()))
                .collect(),
        }
    }

    pub fn map_count(&self) -> usize {
        self.map_count
    }

    pub fn reduce_count(&self) -> usize {
        self.reduce_count
    }

    #[inline(always)]
    fn index(&self, map_id: usize, reduce_id: usize) -> usize {
        map_id * self.reduce_count + reduce_id
    }

    pub fn cell(&self, map_id: usize, reduce_id: usize) -> &IntermediateCell<H> {
        // SAFETY: cells are only mutated through `&mut self` or through
        // lanes, and lanes keep `self` mutably borrowed while they live.
        unsafe { &*self.cells[self.index(map_id, reduce_id)].get() }
    }

    pub fn cell_mut(&mut self, map_id: usize, reduce_id: usize) -> &mut IntermediateCell<H> {
        let idx = self.index(map_id, reduce_id);
        self.cells[idx].get_mut()
    }

    pub fn total_blocks(&self) -> usize {
        (0..self.map_count)
            .cartesian_product(0..self.reduce_count)
            .map(|(m, r)| self.cell(m, r).blocks().len())
            .sum()
    }

    pub fn used_bytes(&self) -> usize {
        (0..self.map_count)
            .cartesian_product(0..self.reduce_count)
            .map(|(m, r)| self.cell(m, r).used_bytes())
            .sum()
    }

    /// Deallocates every block of every cell.
    pub fn reset<A>(&mut self, alloc: &A)
    where
        A: Allocator<Handle = H>,
    {
        for cell in self.cells.iter_mut() {
            cell.get_mut().release(alloc);
        }
    }

    /// Splits the store into one writer lane per mapper and one reader lane
    /// per reducer. A [`MapLane`] hands out its mapper's row of cells
    /// mutably; a [`ReduceLane`] can read its reducer's column only once it
    /// holds a [`MapPhaseComplete`], and the engine drops every map lane
    /// before its mapper arrives at the map rendezvous.
    pub(crate) fn lanes(&mut self) -> (Vec<MapLane<'_, H>>, Vec<ReduceLane<'_, H>>) {
        let store: &IntermediateStore<H> = self;
        let maps = (0..store.map_count).map(|map_id| MapLane { store, map_id }).collect();
        let reds = (0..store.reduce_count).map(|reduce_id| ReduceLane { store, reduce_id }).collect();

        (maps, reds)
    }
}

pub struct MapLane<'a, H> {
    store:  &'a IntermediateStore<H>,
    map_id: usize,
}

impl<H> MapLane<'_, H> {
    pub fn cell_mut(&mut self, reduce_id: usize) -> &mut IntermediateCell<H> {
        assert!(reduce_id < self.store.reduce_count);
        let idx = self.store.index(self.map_id, reduce_id);
        // SAFETY: exactly one lane exists per map id and it is borrowed
        // mutably here. Reduce lanes read this row only after the map
        // rendezvous, which this lane's mapper reaches after dropping it.
        unsafe { &mut *self.store.cells[idx].get() }
    }
}

pub struct ReduceLane<'a, H> {
    store:      &'a IntermediateStore<H>,
    reduce_id:  usize,
}

impl<'a, H> ReduceLane<'a, H> {
    /// Cells `(0, r), (1, r), ..., (M-1, r)` in mapper order.
    pub fn cells<'t>(&'t self, _done: &'t MapPhaseComplete) -> impl Iterator<Item = &'t IntermediateCell<H>> + 't {
        let store = self.store;
        let reduce_id = self.reduce_id;
        (0..store.map_count).map(move |map_id| {
            // SAFETY: the map phase is over, so no writer lane is alive.
            unsafe { &*store.cells[store.index(map_id, reduce_id)].get() }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts what reaches the wrapped heap.
    struct Counting {
        inner:      HeapAllocator,
        allocs:     AtomicUsize,
        sizes:      Mutex<Vec<usize>>,
    }

    impl Counting {
        fn new(capacity: usize) -> Self {
            Self {
                inner:  HeapAllocator::new(capacity, Fit::First).unwrap(),
                allocs: AtomicUsize::new(0),
                sizes:  Mutex::new(vec![]),
            }
        }
    }

    impl Allocator for Counting {
        type Handle = HeapBlock;

        fn init(&self) -> Result<(), MrError> { self.inner.init() }
        fn shutdown(&self) -> Result<(), MrError> { self.inner.shutdown() }
        fn deallocate(&self, handle: HeapBlock) { self.inner.deallocate(handle) }

        fn allocate(&self, size: usize) -> Result<HeapBlock, MrError> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(size);
            self.inner.allocate(size)
        }

        fn scoped<R>(&self, h: &HeapBlock, f: impl FnOnce(&[u8]) -> R) -> Result<R, MrError> {
            self.inner.scoped(h, f)
        }

        fn scoped_mut<R>(&self, h: &mut HeapBlock, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, MrError> {
            self.inner.scoped_mut(h, f)
        }
    }

    fn collect(cell: &IntermediateCell<HeapBlock>, alloc: &Counting) -> Vec<u8> {
        let mut out = vec![];
        cell.for_each_block(alloc, |bytes| out.extend_from_slice(bytes)).unwrap();
        out
    }

    #[test]
    fn records_fill_blocks_then_spill() {
        let alloc = Counting::new(4096);
        let mut cell = IntermediateCell::new();
        // 21 records of 24 bytes fit a 512-byte block, the 22nd spills.
        for idx in 0..22u8 {
            cell.emit(&alloc, 512, &[idx; 24]).unwrap();
        }
        assert_eq!(alloc.allocs.load(Ordering::SeqCst), 2);
        assert_eq!(cell.blocks().iter().map(Block::used).collect_vec(), vec![504, 24]);
        let bytes = collect(&cell, &alloc);
        assert_eq!(bytes.len(), 22 * 24);
        assert!(bytes.chunks(24).enumerate().all(|(i, rec)| rec.iter().all(|&b| b == i as u8)));
    }

    #[test]
    fn exact_fit_appends_in_place() {
        let alloc = Counting::new(4096);
        let mut cell = IntermediateCell::new();
        // Two 24-byte records fill a 48-byte block to the last byte.
        assert_eq!(cell.emit(&alloc, 48, &[1; 24]).unwrap(), Spill::NewBlock { capacity: 48 });
        assert_eq!(cell.emit(&alloc, 48, &[2; 24]).unwrap(), Spill::InPlace);
        assert_eq!(cell.blocks()[0].remaining(), 0);
        assert_eq!(cell.emit(&alloc, 48, &[3; 24]).unwrap(), Spill::NewBlock { capacity: 48 });
        assert_eq!(alloc.allocs.load(Ordering::SeqCst), 2);
        assert_eq!(cell.blocks().iter().map(Block::used).collect_vec(), vec![48, 24]);
        let bytes = collect(&cell, &alloc);
        assert!(bytes.chunks(24).enumerate().all(|(i, rec)| rec.iter().all(|&b| b == i as u8 + 1)));
    }

    #[test]
    fn oversized_record_gets_its_own_block() {
        let alloc = Counting::new(4096);
        let mut cell = IntermediateCell::new();
        assert_eq!(cell.emit(&alloc, 64, &[1; 16]).unwrap(), Spill::NewBlock { capacity: 64 });
        assert_eq!(cell.emit(&alloc, 64, &[2; 100]).unwrap(), Spill::NewBlock { capacity: 100 });
        assert_eq!(cell.emit(&alloc, 64, &[3; 8]).unwrap(), Spill::NewBlock { capacity: 64 });
        assert_eq!(*alloc.sizes.lock().unwrap(), vec![64, 100, 64]);
        assert_eq!(collect(&cell, &alloc).len(), 124);
    }

    #[test]
    fn failed_allocation_leaves_cell_untouched() {
        let alloc = Counting::new(64);
        let mut cell = IntermediateCell::new();
        cell.emit(&alloc, 48, &[1; 40]).unwrap();
        let err = cell.emit(&alloc, 48, &[2; 16]).unwrap_err();
        assert!(matches!(err, MrError::AllocationFailure { requested: 48, .. }));
        assert_eq!(cell.blocks().len(), 1);
        assert_eq!(cell.used_bytes(), 40);
    }

    #[test]
    fn reset_gives_every_block_back() {
        let alloc = Counting::new(1 << 16);
        let mut store = IntermediateStore::new(3, 2);
        for (m, r) in (0..3).cartesian_product(0..2) {
            for _ in 0..5 {
                store.cell_mut(m, r).emit(&alloc, 32, &[(m * 2 + r) as u8; 24]).unwrap();
            }
        }
        assert_eq!(store.total_blocks(), 3 * 2 * 5);
        assert_eq!(store.used_bytes(), 3 * 2 * 5 * 24);
        store.reset(&alloc);
        assert_eq!(store.total_blocks(), 0);
        assert_eq!(alloc.inner.stats().live_bytes, 0);
    }
}
