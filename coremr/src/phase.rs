use crate::helpe::*;

#[derive(Debug, Default)]
struct Gate {
    arrived:    usize,
    open:       bool,
    aborted:    bool,
}

/// A one-shot rendezvous for a fixed number of participants. The last one
/// to arrive opens the gate and releases everybody else.
///
/// Unlike `std::sync::Barrier`, a rendezvous can be aborted: every waiter
/// (and every late arrival) then gets [`MrError::Aborted`] instead of
/// blocking forever on a sibling that will never show up.
#[derive(Debug)]
pub struct Rendezvous {
    name:       &'static str,
    expected:   usize,
    gate:       Mutex<Gate>,
    cvar:       Condvar,
}

impl Rendezvous {
    pub fn new(name: &'static str, expected: usize) -> Self {
        Self {
            name,
            expected,
            gate: Mutex::new(Gate::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_open(&self) -> bool {
        lock(&self.gate).open
    }

    pub fn arrive_and_wait(&self) -> Result<(), MrError> {
        let mut gate = lock(&self.gate);
        if gate.aborted {
            return Err(MrError::Aborted);
        }
        gate.arrived += 1;
        if gate.arrived == self.expected {
            gate.open = true;
            trace!(rendezvous = self.name, participants = self.expected, "gate open");
            self.cvar.notify_all();
            return Ok(());
        }
        while !gate.open && !gate.aborted {
            gate = self.cvar.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }

        if gate.open { Ok(()) } else { Err(MrError::Aborted) }
    }

    pub fn abort(&self) {
        let mut gate = lock(&self.gate);
        if !gate.aborted {
            gate.aborted = true;
            debug!(rendezvous = self.name, arrived = gate.arrived, "aborted");
        }
        self.cvar.notify_all();
    }

    pub(crate) fn rearm(&mut self) {
        *self.gate.get_mut().unwrap_or_else(PoisonError::into_inner) = Gate::default();
    }
}

/// Proof that every mapper of the current iteration is done. Only
/// [`PhaseSync::reducer_ready`] makes one, and reading an intermediate
/// cell requires one.
#[derive(Debug)]
pub struct MapPhaseComplete {
    _seal: (),
}

/// The two phase boundaries of one iteration.
#[derive(Debug)]
pub struct PhaseSync {
    map_done:       Rendezvous,
    reduce_done:    Rendezvous,
}

impl PhaseSync {
    pub fn new(map_count: usize, reduce_count: usize) -> Self {
        Self {
            map_done:       Rendezvous::new("map_done", map_count + reduce_count),
            reduce_done:    Rendezvous::new("reduce_done", reduce_count),
        }
    }

    /// A mapper is through with its partition.
    pub fn mapper_done(&self) -> Result<(), MrError> {
        self.map_done.arrive_and_wait()
    }

    /// A reducer has started. Returns once all mappers are done.
    pub fn reducer_ready(&self) -> Result<MapPhaseComplete, MrError> {
        self.map_done.arrive_and_wait()?;
        Ok(MapPhaseComplete { _seal: () })
    }

    pub fn reducer_done(&self, _proof: MapPhaseComplete) -> Result<(), MrError> {
        self.reduce_done.arrive_and_wait()
    }

    pub fn map_phase_over(&self) -> bool {
        self.map_done.is_open()
    }

    /// Releases every current and future waiter of this iteration.
    pub fn abort(&self) {
        self.map_done.abort();
        self.reduce_done.abort();
    }

    /// Aborts unless disarmed, including when the owning worker unwinds.
    pub fn abort_on_drop(&self) -> AbortGuard<'_> {
        AbortGuard { sync: self, armed: true }
    }

    pub(crate) fn rearm(&mut self) {
        self.map_done.rearm();
        self.reduce_done.rearm();
    }
}

pub struct AbortGuard<'a> {
    sync:   &'a PhaseSync,
    armed:  bool,
}

impl AbortGuard<'_> {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.sync.abort();
        }
    }
}
