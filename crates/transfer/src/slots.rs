use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum TransferKind {
    #[display("download")]
    Download,
    #[display("upload")]
    Upload,
}

type OccupancyListener = Box<dyn Fn(usize) + Send + Sync>;

/// A counting semaphore whose capacity can change, but only while nobody is
/// holding or waiting for a slot. In-flight holders always keep the permit
/// they were given.
pub struct SlotPool {
    kind: TransferKind,
    state: Mutex<PoolState>,
    on_occupancy: Option<OccupancyListener>,
}

struct PoolState {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    /// Waiters plus holders.
    outstanding: usize,
    held: usize,
}

impl SlotPool {
    pub fn new(kind: TransferKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            state: Mutex::new(PoolState {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                outstanding: 0,
                held: 0,
            }),
            on_occupancy: None,
        }
    }

    /// Called with the number of held slots every time it changes.
    pub fn on_occupancy_change(mut self, listener: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_occupancy = Some(Box::new(listener));
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn in_use(&self) -> usize {
        self.lock().held
    }

    pub fn is_idle(&self) -> bool {
        self.lock().outstanding == 0
    }

    /// Rebuild the pool with `capacity` slots if nobody holds or waits for
    /// one. Returns whether the capacity is now `capacity`.
    pub fn resize_if_idle(&self, capacity: usize) -> bool {
        let capacity = capacity.max(1);
        let mut state = self.lock();
        if state.capacity == capacity {
            return true;
        }
        if state.outstanding > 0 {
            tracing::debug!(kind = %self.kind, from = state.capacity, to = capacity, "Pool busy; deferring resize");
            return false;
        }
        tracing::info!(kind = %self.kind, from = state.capacity, to = capacity, "Resizing slot pool");
        state.semaphore = Arc::new(Semaphore::new(capacity));
        state.capacity = capacity;
        true
    }

    /// Wait for a free slot. The slot is released when the guard drops.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Result<SlotGuard> {
        let semaphore = {
            let mut state = self.lock();
            state.outstanding += 1;
            Arc::clone(&state.semaphore)
        };
        // Created before waiting so that a cancelled or dropped acquire still
        // gives back its place in `outstanding`.
        let mut guard = SlotGuard { pool: Arc::clone(self), permit: None };
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
            permit = semaphore.acquire_owned() => permit.or_raise(|| ErrorKind::Cancelled)?,
        };
        guard.permit = Some(permit);
        let held = {
            let mut state = self.lock();
            state.held += 1;
            state.held
        };
        tracing::trace!(kind = %self.kind, held, "Acquired transfer slot");
        self.notify(held);
        Ok(guard)
    }

    fn release(&self, was_held: bool) {
        let held = {
            let mut state = self.lock();
            match state.outstanding.checked_sub(1) {
                Some(outstanding) => state.outstanding = outstanding,
                None => tracing::warn!(kind = %self.kind, "Released more slots than were acquired"),
            }
            if !was_held {
                return;
            }
            match state.held.checked_sub(1) {
                Some(held) => state.held = held,
                None => tracing::warn!(kind = %self.kind, "Released a slot that wasn't held"),
            }
            state.held
        };
        tracing::trace!(kind = %self.kind, held, "Released transfer slot");
        self.notify(held);
    }

    fn notify(&self, held: usize) {
        if let Some(listener) = &self.on_occupancy {
            listener(held);
        }
    }
}

/// A held (or still awaited) slot.
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SlotGuard {
    pub fn kind(&self) -> TransferKind {
        self.pool.kind
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let was_held = self.permit.take().is_some();
        self.pool.release(was_held);
    }
}
