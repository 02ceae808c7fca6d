use farmem::{FarHandle, FarMemory};

use crate::{helpe::*, kmeans::{assign_and_emit, average_owned, Clustering, KMeans, PointBuffer}};

/// One far-memory block of a [`FarDataset`]. Records fill `[0, used)`.
#[derive(Debug)]
pub struct FarExtent {
    handle: FarHandle,
    used:   usize,
}

impl FarExtent {
    pub fn handle(&self) -> &FarHandle {
        &self.handle
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

/// Points pre-loaded into fixed-size blocks of a far memory pool. Blocks
/// hold whole records only, so the unit of partitioning is the block.
pub struct FarDataset {
    layout: RecordLayout,
    mem:    Arc<FarMemory>,
    blocks: Vec<FarExtent>,
    points: usize,
}

/// A mapper's contiguous run of dataset blocks.
pub struct FarRun<'a> {
    pub mem:        &'a FarMemory,
    pub extents:    &'a mut [FarExtent],
}

impl FarDataset {
    /// Copies `points` into blocks of at most `block_bytes` bytes each
    /// (at least one record per block).
    pub fn upload(mem: Arc<FarMemory>, points: &PointBuffer, block_bytes: usize) -> Result<Self, MrError> {
        let layout = points.layout();
        let per_block = (block_bytes / layout.stride()).max(1);
        let chunk = per_block * layout.stride();
        let mut res = Self { layout, mem, blocks: vec![], points: points.len() };
        for piece in points.as_bytes().chunks(chunk) {
            // Dropping `res` on error gives the earlier blocks back.
            let mut handle = res.mem.allocate(chunk)?;
            if let Err(e) = res.mem.scoped_mut(&mut handle, |bytes| bytes[..piece.len()].copy_from_slice(piece)) {
                res.mem.deallocate(handle);
                return Err(e.into());
            }
            res.blocks.push(FarExtent { handle, used: piece.len() });
        }
        info!(points = res.points, blocks = res.blocks.len(), records_per_block = per_block, "dataset uploaded");

        Ok(res)
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn memory(&self) -> &Arc<FarMemory> {
        &self.mem
    }

    pub fn blocks(&self) -> &[FarExtent] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    /// Brings every record back into local memory, labels included.
    pub fn download(&self) -> Result<PointBuffer, MrError> {
        let mut bytes = Vec::with_capacity(self.points * self.layout.stride());
        for ext in &self.blocks {
            self.mem.scoped(&ext.handle, |b| bytes.extend_from_slice(&b[..ext.used]))?;
        }
        PointBuffer::from_records(self.layout.dim(), bytes)
    }
}

impl Drop for FarDataset {
    fn drop(&mut self) {
        for ext in self.blocks.drain(..) {
            self.mem.deallocate(ext.handle);
        }
    }
}

impl Splittable for FarDataset {
    type Part<'a> = FarRun<'a>;

    fn units(&self) -> usize {
        self.blocks.len()
    }

    fn split<'a>(&'a mut self, plan: &[Partition]) -> Vec<FarRun<'a>> {
        let mem = &*self.mem;
        split_slice_mut(&mut self.blocks, plan)
            .into_iter()
            .map(|extents| FarRun { mem, extents })
            .collect()
    }
}

/// [`KMeans`] over a [`FarDataset`]: every dataset block is labelled
/// inside its own scoped binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarKMeans {
    inner: KMeans,
}

impl FarKMeans {
    pub fn new(dim: usize, means: usize) -> Result<Self, MrError> {
        Ok(Self { inner: KMeans::new(dim, means)? })
    }

    pub fn inner(&self) -> &KMeans {
        &self.inner
    }

    pub fn clustering(self, centroids: AggregateState<f64>) -> Result<Clustering<FarKMeans>, MrError> {
        self.inner.check_centroids(&centroids)?;
        Ok(Clustering { job: self, centroids })
    }
}

impl<A: Allocator> Job<A> for FarKMeans {
    type Input = FarDataset;
    type Value = f64;

    fn partition(&self, input: &FarDataset, map_count: usize) -> Vec<Partition> {
        Partition::split_even(input.blocks().len(), 1, map_count)
    }

    fn map(&self, run: FarRun<'_>, task: &mut MapTask<'_, A, f64>) -> Result<(), MrError> {
        let layout = self.inner.layout();
        for ext in run.extents.iter_mut() {
            let used = ext.used;
            run.mem.scoped_mut(&mut ext.handle, |bytes| assign_and_emit(layout, &mut bytes[..used], task))??;
        }

        Ok(())
    }

    fn reduce(&self, task: &mut ReduceTask<'_, A, f64>) -> Result<(), MrError> {
        average_owned(self.inner.layout(), task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmem::FarConfig;

    fn pool(cache_bytes: usize) -> Arc<FarMemory> {
        let cfg = FarConfig { cache_bytes, far_bytes: 1 << 20, block_bytes: 64 };
        Arc::new(FarMemory::connect(cfg, "127.0.0.1:7100".parse().unwrap()).unwrap())
    }

    #[test]
    fn blocks_hold_whole_records() {
        let points = PointBuffer::from_coords(2, &(0..30).map(f64::from).collect_vec()).unwrap();
        // 24-byte records, 64-byte blocks: two records per block.
        let data = FarDataset::upload(pool(128), &points, 64).unwrap();
        assert_eq!(data.blocks().len(), 8);
        assert!(data.blocks().iter().all(|e| e.used() % 24 == 0));
        assert_eq!(data.blocks().last().unwrap().used(), 24);
        assert_eq!(data.download().unwrap(), points);
    }

    #[test]
    fn tiny_blocks_still_take_one_record() {
        let points = PointBuffer::from_coords(3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let data = FarDataset::upload(pool(64), &points, 8).unwrap();
        assert_eq!(data.blocks().len(), 2);
        assert_eq!(data.download().unwrap().point(1), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn dropping_the_dataset_frees_the_pool() {
        let mem = pool(256);
        let points = PointBuffer::from_coords(1, &[1.0, 2.0, 3.0]).unwrap();
        let data = FarDataset::upload(mem.clone(), &points, 16).unwrap();
        assert_eq!(mem.stats().objects, 3);
        drop(data);
        assert_eq!(mem.stats().objects, 0);
        assert_eq!(mem.stats().far_used, 0);
    }
}
