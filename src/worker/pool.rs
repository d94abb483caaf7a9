use crate::cancel::Cancellation;
use crate::error::ServiceResult;
use crate::worker::WorkerSlot;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Fixed set of worker slots.
///
/// Idle slots sit in a FIFO free list. A fair semaphore sized to the number of
/// slots gates checkout, so waiters are served in the order they arrived and
/// a permit always corresponds to a slot in the free list.
pub struct WorkerPool {
    idle: Arc<Mutex<VecDeque<WorkerSlot>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(slots: Vec<WorkerSlot>) -> Self {
        let size = slots.len();
        Self {
            idle: Arc::new(Mutex::new(slots.into_iter().collect())),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for an idle slot, or fails once `cancel` fires.
    ///
    /// A signal that has already fired wins over a free slot, so an expired
    /// caller never takes a slot.
    pub async fn checkout(
        &self,
        cancel: &Cancellation,
    ) -> ServiceResult<SlotGuard> {
        if let Some(err) = cancel.is_fired() {
            return Err(err);
        }
        let permit = tokio::select! {
            biased;
            err = cancel.fired() => return Err(err),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| anyhow::anyhow!("worker pool closed"))?
            }
        };

        let slot = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("permit granted with no idle slot"))?;
        debug!(slot = slot.id, device = %slot.device, "checked out worker slot");

        Ok(SlotGuard {
            slot: Some(slot),
            idle: self.idle.clone(),
            _permit: permit,
        })
    }
}

/// A checked-out slot. Dropping the guard puts the slot back at the end of
/// the free list before releasing its permit, on every exit path including
/// unwinding.
#[derive(Debug)]
pub struct SlotGuard {
    slot: Option<WorkerSlot>,
    idle: Arc<Mutex<VecDeque<WorkerSlot>>>,
    // Dropped after `drop` below has returned the slot.
    _permit: OwnedSemaphorePermit,
}

impl Deref for SlotGuard {
    type Target = WorkerSlot;

    fn deref(&self) -> &WorkerSlot {
        // Only `drop` takes the slot out.
        self.slot.as_ref().expect("slot present until drop")
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            debug!(slot = slot.id, "returned worker slot");
            self.idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push_back(slot);
        }
    }
}
