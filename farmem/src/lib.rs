//! `farmem` is a small disaggregated-memory manager.
//!
//! Objects live in a *far tier* reached through a [`Transport`]. Their
//! bytes can only be touched inside a **scoped binding**
//! ([`FarMemory::scoped`] / [`FarMemory::scoped_mut`]): on entry the
//! object is pinned and made resident in a bounded local cache, on exit
//! (normal return, early `?`, or unwinding) the pin is dropped and the
//! cache is free to evict the object again.
//!
//! > ***ATTENTION:*** a [`FarHandle`] is *not* an address. It names an
//! > object whose bytes may be anywhere at any point in time. Never hold
//! > on to a slice obtained inside a binding; the borrow checker will
//! > stop you anyway.

mod cache;
mod config;
mod transport;

pub use cache::{FarMemory, FarStats};
pub use config::FarConfig;
pub use transport::{Loopback, Transport};

use std::path::PathBuf;
use thiserror::Error;

/// Names one object of the far tier.
///
/// Handles are move-only: reading through a handle requires `&FarHandle`,
/// writing requires `&mut FarHandle`, and giving the memory back consumes
/// it. This is what keeps two writers from ever binding the same object.
#[derive(Debug)]
pub struct FarHandle {
    pool:   u64,
    id:     u64,
    len:    usize,
}

impl FarHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the object in bytes, as requested at allocation time.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A zero-filled buffer of `len` bytes, or `None` if the process cannot
/// get that much memory.
pub(crate) fn zeroed(len: usize) -> Option<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0u8);

    Some(buf.into_boxed_slice())
}

#[derive(Error, Debug)]
pub enum FarError {
    #[error("cannot read config {path}: {source}")]
    ConfigIo {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config {path}: {source}")]
    ConfigParse {
        path:   PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid far-memory config: {0}")]
    Invalid(String),
    #[error("far tier exhausted: requested {requested} bytes, {available} of {capacity} left")]
    Exhausted {
        requested:  usize,
        available:  usize,
        capacity:   usize,
    },
    #[error("object {0} is unknown to this memory pool")]
    UnknownObject(u64),
    #[error("transport failure on object {id}: {reason}")]
    Transport {
        id:     u64,
        reason: String,
    },
}
