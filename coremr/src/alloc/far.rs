use farmem::{FarHandle, FarMemory};

use crate::{alloc::Allocator, helpe::*};

/// Intermediate blocks kept in a disaggregated memory pool.
///
/// Iteration boundaries map onto the pool's run lifecycle: `init` opens a
/// run, `shutdown` writes every dirty, unpinned object back to the far
/// tier and empties the local cache.
#[derive(Clone)]
pub struct FarAllocator {
    mem: Arc<FarMemory>,
}

impl FarAllocator {
    pub fn new(mem: Arc<FarMemory>) -> Self {
        Self { mem }
    }

    pub fn memory(&self) -> &Arc<FarMemory> {
        &self.mem
    }
}

impl Allocator for FarAllocator {
    type Handle = FarHandle;

    fn init(&self) -> Result<(), MrError> {
        self.mem.begin_run();
        Ok(())
    }

    fn allocate(&self, size: usize) -> Result<FarHandle, MrError> {
        Ok(self.mem.allocate(size)?)
    }

    fn deallocate(&self, handle: FarHandle) {
        self.mem.deallocate(handle);
    }

    fn shutdown(&self) -> Result<(), MrError> {
        self.mem.end_run()?;
        let stats = self.mem.stats();
        debug!(
            hits = stats.hits,
            fetches = stats.fetches,
            evictions = stats.evictions,
            writebacks = stats.writebacks,
            far_used = stats.far_used,
            "far run closed"
        );

        Ok(())
    }

    fn scoped<R>(&self, handle: &FarHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R, MrError> {
        Ok(self.mem.scoped(handle, f)?)
    }

    fn scoped_mut<R>(
        &self,
        handle: &mut FarHandle,
        f:      impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MrError> {
        Ok(self.mem.scoped_mut(handle, f)?)
    }
}
