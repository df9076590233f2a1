use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// A reusable rendezvous point for a fixed number of worker threads.
///
/// Unlike [`std::sync::Barrier`] it can be cancelled: a worker that hits a fatal
/// error cancels the barrier so that its peers return [`BarrierCancelled`] instead
/// of blocking forever on a collective that will never complete.
#[derive(Debug)]
pub struct WorkerBarrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
    parties: usize,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    cancelled: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("worker barrier was cancelled")]
pub struct BarrierCancelled;

impl WorkerBarrier {
    pub fn new(parties: usize) -> Arc<Self> {
        assert!(parties > 0, "a barrier needs at least one party");
        Arc::new(Self {
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
            parties,
        })
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until all parties have arrived, or until the barrier is cancelled.
    pub fn wait(&self) -> Result<(), BarrierCancelled> {
        let mut state = self.lock();
        if state.cancelled {
            return Err(BarrierCancelled);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        loop {
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            if state.generation != generation {
                return Ok(());
            }
            if state.cancelled {
                return Err(BarrierCancelled);
            }
        }
    }

    /// Wakes every waiter with [`BarrierCancelled`]. Later calls to `wait` fail
    /// immediately.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        self.cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }
}
