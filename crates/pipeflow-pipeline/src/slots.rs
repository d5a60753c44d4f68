//! A fixed pool of execution slots (concurrent inference capacity).
//!
//! Acquisition waits at most a short, bounded time; failure means "retry
//! later", never an error.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct ExecutionSlots {
    free: Mutex<Vec<usize>>,
    cv: Condvar,
    capacity: usize,
}

impl ExecutionSlots {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..capacity).rev().collect()),
            cv: Condvar::new(),
            capacity,
        })
    }

    pub fn try_acquire(self: &Arc<Self>, timeout: Duration) -> Option<SlotGuard> {
        let deadline = Instant::now() + timeout;
        let mut free = self.lock();
        loop {
            if let Some(id) = free.pop() {
                return Some(SlotGuard { slots: Arc::clone(self), id });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            free = match self.cv.wait_timeout(free, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<usize>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One claimed slot; returned to the pool on drop.
pub struct SlotGuard {
    slots: Arc<ExecutionSlots>,
    id: usize,
}

impl SlotGuard {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.lock().push(self.id);
        self.slots.cv.notify_one();
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").field("id", &self.id).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_and_refills() {
        let slots = ExecutionSlots::new(2);
        let a = slots.try_acquire(Duration::ZERO).unwrap();
        let b = slots.try_acquire(Duration::ZERO).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(slots.try_acquire(Duration::from_millis(2)).is_none());
        drop(a);
        assert_eq!(slots.available(), 1);
        assert!(slots.try_acquire(Duration::ZERO).is_some());
    }

    #[test]
    fn waiter_gets_released_slot() {
        let slots = ExecutionSlots::new(1);
        let held = slots.try_acquire(Duration::ZERO).unwrap();
        let other = Arc::clone(&slots);
        let waiter = std::thread::spawn(move || other.try_acquire(Duration::from_secs(5)).is_some());
        std::thread::sleep(Duration::from_millis(10));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
