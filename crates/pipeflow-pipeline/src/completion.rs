//! Thread-safe queue of "node session finished" events.
//!
//! Any number of producers (plugin workers, backend callbacks) push; the
//! request's scheduler is the single consumer and pulls with a bounded wait.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A `(node, session key)` pair whose execution has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub node: String,
    pub key: String,
}

#[derive(Clone, Default)]
pub struct CompletionQueue {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    events: Mutex<VecDeque<SessionEvent>>,
    cv: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: SessionEvent) {
        self.lock().push_back(event);
        self.inner.cv.notify_one();
    }

    /// Next event, or `None` once `timeout` elapses without one.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            events = match self.inner.cv.wait_timeout(events, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// True when an event is waiting to be pulled.
    pub fn has_pending(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SessionEvent>> {
        self.inner.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn event(node: &str) -> SessionEvent {
        SessionEvent { node: node.into(), key: "req".into() }
    }

    #[test]
    fn fifo_order() {
        let q = CompletionQueue::new();
        q.push(event("a"));
        q.push(event("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_timeout(Duration::ZERO).unwrap().node, "a");
        assert_eq!(q.pop_timeout(Duration::ZERO).unwrap().node, "b");
        assert!(q.is_empty());
    }

    #[test]
    fn times_out_when_empty() {
        let q = CompletionQueue::new();
        let start = Instant::now();
        assert!(q.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wakes_on_push_from_other_threads() {
        let q = CompletionQueue::new();
        let producers: Vec<_> = (0..4)
            .map(|i| {
                let q = q.clone();
                thread::spawn(move || q.push(event(&format!("n{i}"))))
            })
            .collect();
        let mut got = 0;
        while got < 4 {
            if q.pop_timeout(Duration::from_secs(5)).is_some() {
                got += 1;
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        assert!(!q.has_pending());
    }
}
