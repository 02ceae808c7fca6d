use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::{zeroed, FarConfig, FarError, FarHandle, Loopback, Transport};

/// Distinguishes pools so that a handle cannot be used with a pool that
/// did not hand it out.
static NEXT_POOL: AtomicU64 = AtomicU64::new(1);

/// Local state of one far object.
struct Frame {
    // `Some` while resident in the local cache.
    local:  Option<Box<[u8]>>,
    dirty:  bool,
    // Never written back yet: the far copy is all zeros, no need to fetch it.
    fresh:  bool,
}

struct Directory {
    frames:         HashMap<u64, Arc<Mutex<Frame>>>,
    // Least recently bound first.
    resident:       IndexMap<u64, usize>,
    pins:           HashMap<u64, u32>,
    resident_bytes: usize,
    far_used:       usize,
}

#[derive(Default)]
struct Counters {
    hits:       AtomicU64,
    fetches:    AtomicU64,
    evictions:  AtomicU64,
    writebacks: AtomicU64,
}

/// A snapshot of a pool's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FarStats {
    pub hits:           u64,
    pub fetches:        u64,
    pub evictions:      u64,
    pub writebacks:     u64,
    pub objects:        usize,
    pub resident_bytes: usize,
    pub far_used:       usize,
}

/// A pool of far memory fronted by an LRU cache of pinned/unpinned frames.
pub struct FarMemory {
    cfg:        FarConfig,
    pool:       u64,
    transport:  Box<dyn Transport>,
    next_id:    AtomicU64,
    dir:        Mutex<Directory>,
    counters:   Counters,
}

/// Held for the duration of a scoped binding; unpins on drop, which also
/// covers unwinding out of the caller's closure.
struct Pin<'a> {
    mem:    &'a FarMemory,
    id:     u64,
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.mem.unpin(self.id);
    }
}

#[inline(always)]
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Frames are only poisoned by a panicking caller closure, after which
    // their bytes are still structurally valid.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FarMemory {
    /// Opens a pool whose far tier is served at `addr`.
    pub fn connect(cfg: FarConfig, addr: SocketAddr) -> Result<Self, FarError> {
        Self::with_transport(cfg, Box::new(Loopback::new(addr)))
    }

    pub fn with_transport(cfg: FarConfig, transport: Box<dyn Transport>) -> Result<Self, FarError> {
        cfg.validate()?;
        debug!(
            endpoint = %transport.endpoint(),
            cache_bytes = cfg.cache_bytes,
            far_bytes = cfg.far_bytes,
            "far memory pool opened"
        );

        Ok(Self {
            cfg,
            pool:       NEXT_POOL.fetch_add(1, Ordering::Relaxed),
            transport,
            next_id:    AtomicU64::new(1),
            dir:        Mutex::new(Directory {
                frames:         HashMap::new(),
                resident:       IndexMap::new(),
                pins:           HashMap::new(),
                resident_bytes: 0,
                far_used:       0,
            }),
            counters:   Counters::default(),
        })
    }

    pub fn config(&self) -> &FarConfig {
        &self.cfg
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.transport.endpoint()
    }

    /// Reserves `len` zero-filled bytes in the far tier.
    pub fn allocate(&self, len: usize) -> Result<FarHandle, FarError> {
        let mut dir = lock(&self.dir);
        let available = self.cfg.far_bytes.saturating_sub(dir.far_used);
        if len > available {
            return Err(FarError::Exhausted {
                requested:  len,
                available,
                capacity:   self.cfg.far_bytes,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.transport.reserve(id, len)?;
        dir.frames.insert(id, Arc::new(Mutex::new(Frame { local: None, dirty: false, fresh: true })));
        dir.far_used += len;
        trace!(id, len, "far object allocated");

        Ok(FarHandle { pool: self.pool, id, len })
    }

    /// Gives the object back. Its far copy and any cached copy are dropped.
    pub fn deallocate(&self, handle: FarHandle) {
        if handle.pool != self.pool {
            debug!(id = handle.id, "ignoring foreign handle on deallocate");
            return;
        }
        let mut dir = lock(&self.dir);
        if dir.frames.remove(&handle.id).is_none() {
            return;
        }
        if let Some(bytes) = dir.resident.shift_remove(&handle.id) {
            dir.resident_bytes -= bytes;
        }
        // A binding borrows its handle, so none can be alive here.
        debug_assert!(!dir.pins.contains_key(&handle.id));
        dir.far_used -= handle.len;
        self.transport.release(handle.id);
    }

    /// Runs `f` over the object's bytes while they are pinned in the local cache.
    pub fn scoped<R>(&self, handle: &FarHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R, FarError> {
        let (cell, _pin) = self.pin(handle)?;
        let mut frame = lock(&cell);
        let bytes = self.materialise(handle, &mut frame)?;

        Ok(f(bytes))
    }

    /// Like [`FarMemory::scoped`], but the bytes may be modified. The frame
    /// is marked dirty and written back when it leaves the cache.
    pub fn scoped_mut<R>(&self, handle: &mut FarHandle, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, FarError> {
        let (cell, _pin) = self.pin(handle)?;
        let mut frame = lock(&cell);
        frame.dirty = true;
        let bytes = self.materialise(handle, &mut frame)?;

        Ok(f(bytes))
    }

    /// Called when a run starts using the pool.
    pub fn begin_run(&self) {
        let dir = lock(&self.dir);
        debug!(objects = dir.frames.len(), far_used = dir.far_used, "far memory run started");
    }

    /// Writes every dirty resident frame back and empties the local cache.
    /// Pinned frames stay where they are.
    pub fn end_run(&self) -> Result<(), FarError> {
        let mut dir = lock(&self.dir);
        let unpinned: Vec<(u64, usize)> = dir.resident
            .iter()
            .filter(|(id, _)| !dir.pins.contains_key(*id))
            .map(|(id, bytes)| (*id, *bytes))
            .collect();
        for (id, bytes) in unpinned {
            if let Some(cell) = dir.frames.get(&id) {
                self.evict(id, &mut lock(cell))?;
            }
            dir.resident.shift_remove(&id);
            dir.resident_bytes -= bytes;
        }
        drop(dir);
        debug!(stats = ?self.stats(), "far memory run ended");

        Ok(())
    }

    pub fn stats(&self) -> FarStats {
        let dir = lock(&self.dir);
        FarStats {
            hits:           self.counters.hits.load(Ordering::Relaxed),
            fetches:        self.counters.fetches.load(Ordering::Relaxed),
            evictions:      self.counters.evictions.load(Ordering::Relaxed),
            writebacks:     self.counters.writebacks.load(Ordering::Relaxed),
            objects:        dir.frames.len(),
            resident_bytes: dir.resident_bytes,
            far_used:       dir.far_used,
        }
    }

    fn pin(&self, handle: &FarHandle) -> Result<(Arc<Mutex<Frame>>, Pin<'_>), FarError> {
        if handle.pool != self.pool {
            return Err(FarError::UnknownObject(handle.id));
        }
        let mut dir = lock(&self.dir);
        let cell = dir.frames
            .get(&handle.id)
            .cloned()
            .ok_or(FarError::UnknownObject(handle.id))?;
        if let Some(bytes) = dir.resident.shift_remove(&handle.id) {
            // Touch: move to the most-recently-used end.
            dir.resident.insert(handle.id, bytes);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.make_room(&mut dir, handle.len)?;
            dir.resident.insert(handle.id, handle.len);
            dir.resident_bytes += handle.len;
        }
        *dir.pins.entry(handle.id).or_insert(0) += 1;

        Ok((cell, Pin { mem: self, id: handle.id }))
    }

    fn unpin(&self, id: u64) {
        let mut dir = lock(&self.dir);
        if let Some(n) = dir.pins.get_mut(&id) {
            *n -= 1;
            if *n == 0 {
                dir.pins.remove(&id);
            }
        }
    }

    /// Evicts unpinned frames, least recently used first, until `incoming`
    /// bytes fit. When everything left is pinned the cache overcommits.
    fn make_room(&self, dir: &mut Directory, incoming: usize) -> Result<(), FarError> {
        while dir.resident_bytes + incoming > self.cfg.cache_bytes {
            let victim = dir.resident
                .iter()
                .find(|(id, _)| !dir.pins.contains_key(*id))
                .map(|(id, bytes)| (*id, *bytes));
            let Some((id, bytes)) = victim else {
                debug!(
                    resident = dir.resident_bytes,
                    incoming,
                    budget = self.cfg.cache_bytes,
                    "every resident frame is pinned, overcommitting cache"
                );
                break;
            };
            if let Some(cell) = dir.frames.get(&id) {
                self.evict(id, &mut lock(cell))?;
            }
            dir.resident.shift_remove(&id);
            dir.resident_bytes -= bytes;
        }

        Ok(())
    }

    fn evict(&self, id: u64, frame: &mut Frame) -> Result<(), FarError> {
        if frame.dirty {
            if let Some(local) = &frame.local {
                self.transport.store(id, local)?;
                self.counters.writebacks.fetch_add(1, Ordering::Relaxed);
            }
        }
        frame.local = None;
        frame.dirty = false;
        frame.fresh = false;
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn materialise<'f>(&self, handle: &FarHandle, frame: &'f mut Frame) -> Result<&'f mut [u8], FarError> {
        if frame.local.is_none() {
            let mut buf = zeroed(handle.len).ok_or_else(|| FarError::Transport {
                id:     handle.id,
                reason: format!("no local memory to cache {} bytes", handle.len),
            })?;
            if !frame.fresh {
                self.transport.fetch(handle.id, &mut buf)?;
                self.counters.fetches.fetch_add(1, Ordering::Relaxed);
            }
            frame.fresh = false;
            frame.local = Some(buf);
        }

        frame.local
            .as_deref_mut()
            .ok_or(FarError::UnknownObject(handle.id))
    }
}
