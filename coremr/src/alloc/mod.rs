//! Backing memory for intermediate data.
//!
//! The engine never dereferences a handle itself. Every access to the bytes
//! behind a handle happens inside [`Allocator::scoped`] or
//! [`Allocator::scoped_mut`], which gives backends that move data around
//! (see [`FarAllocator`]) a well-defined window in which the bytes are
//! resident and stable.

mod far;
mod heap;

pub use far::FarAllocator;
pub use heap::{suggested_capacity, Fit, HeapAllocator, HeapBlock, HeapStats, HEAP_ALIGN};

use crate::helpe::*;

/// A source of memory blocks, shared by every worker of an [`Engine`].
///
/// Handles are move-only so that exclusive access to a block's bytes can
/// be expressed as `&mut Handle`.
pub trait Allocator: Send + Sync {
    type Handle: Send + Sync;

    /// Called once before the map phase of each iteration.
    fn init(&self) -> Result<(), MrError>;

    /// Returns a handle to at least `size` bytes. Contents are unspecified.
    fn allocate(&self, size: usize) -> Result<Self::Handle, MrError>;

    /// Gives a block back. Always succeeds, also after [`Allocator::shutdown`].
    fn deallocate(&self, handle: Self::Handle);

    /// Called once after the reduce phase of each iteration. Live handles
    /// stay valid.
    fn shutdown(&self) -> Result<(), MrError>;

    fn scoped<R>(&self, handle: &Self::Handle, f: impl FnOnce(&[u8]) -> R) -> Result<R, MrError>;

    fn scoped_mut<R>(
        &self,
        handle: &mut Self::Handle,
        f:      impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MrError>;
}
