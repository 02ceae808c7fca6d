use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Mutex, PoisonError},
};

use crate::{zeroed, FarError};

/// The wire between the local cache and the far tier.
///
/// Implementations move whole objects; partial transfers are a
/// transport-level optimisation the cache never asks for.
pub trait Transport: Send + Sync {
    /// Where the far tier lives.
    fn endpoint(&self) -> SocketAddr;
    /// Makes room for a new zero-filled object.
    fn reserve(&self, id: u64, len: usize) -> Result<(), FarError>;
    /// Copies the far copy of `id` into `dst`.
    fn fetch(&self, id: u64, dst: &mut [u8]) -> Result<(), FarError>;
    /// Overwrites the far copy of `id` with `src`.
    fn store(&self, id: u64, src: &[u8]) -> Result<(), FarError>;
    /// Drops the far copy of `id`.
    fn release(&self, id: u64);
}

/// An in-process far tier. Serves as the memory node for single-host
/// runs and for tests; the `endpoint` is recorded but never dialled.
pub struct Loopback {
    addr:       SocketAddr,
    objects:    Mutex<HashMap<u64, Box<[u8]>>>,
}

impl Loopback {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            objects: Mutex::new(HashMap::new()),
        }
    }
}

impl Transport for Loopback {
    fn endpoint(&self) -> SocketAddr {
        self.addr
    }

    fn reserve(&self, id: u64, len: usize) -> Result<(), FarError> {
        let bytes = zeroed(len).ok_or_else(|| FarError::Transport {
            id,
            reason: format!("memory node cannot back {len} bytes"),
        })?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if objects.insert(id, bytes).is_some() {
            return Err(FarError::Transport { id, reason: "object id reused".into() });
        }

        Ok(())
    }

    fn fetch(&self, id: u64, dst: &mut [u8]) -> Result<(), FarError> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let src = objects.get(&id).ok_or(FarError::UnknownObject(id))?;
        if src.len() != dst.len() {
            return Err(FarError::Transport { id, reason: format!("size mismatch ({} vs {})", src.len(), dst.len()) });
        }
        dst.copy_from_slice(src);

        Ok(())
    }

    fn store(&self, id: u64, src: &[u8]) -> Result<(), FarError> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let dst = objects.get_mut(&id).ok_or(FarError::UnknownObject(id))?;
        if src.len() != dst.len() {
            return Err(FarError::Transport { id, reason: format!("size mismatch ({} vs {})", src.len(), dst.len()) });
        }
        dst.copy_from_slice(src);

        Ok(())
    }

    fn release(&self, id: u64) {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Loopback {
        Loopback::new("127.0.0.1:7200".parse().unwrap())
    }

    #[test]
    fn objects_round_trip_through_the_node() {
        let node = node();
        node.reserve(1, 4).unwrap();
        let mut out = [9; 4];
        node.fetch(1, &mut out).unwrap();
        assert_eq!(out, [0; 4]);
        node.store(1, &[1, 2, 3, 4]).unwrap();
        node.fetch(1, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        node.release(1);
        assert!(matches!(node.fetch(1, &mut out), Err(FarError::UnknownObject(1))));
    }

    #[test]
    fn unbackable_object_is_refused() {
        let node = node();
        assert!(matches!(node.reserve(5, usize::MAX), Err(FarError::Transport { id: 5, .. })));
        // Nothing was recorded for the refused id.
        node.reserve(5, 8).unwrap();
    }
}
