use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounded count of in-flight workers for one processor.
///
/// Slots are taken on the polling thread and released when the worker's
/// [`SlotGuard`] drops, which happens on the worker thread after the task's
/// final state has been written.
#[derive(Debug)]
pub struct WorkerSlots {
    max: usize,
    in_flight: AtomicUsize,
}

impl WorkerSlots {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take a slot if one is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max).then_some(n + 1))
            .ok()
            .map(|_| SlotGuard { slots: self.clone() })
    }
}

/// One occupied worker slot, released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    slots: Arc<WorkerSlots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
