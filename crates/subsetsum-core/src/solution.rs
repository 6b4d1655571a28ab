//! Bounded blocking queue feeding the single solution sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    cells: Box<[Option<T>]>,
    read_pos: usize,
    write_pos: usize,
}

/// Simple bounded FIFO with condition-variable signalling and a cancel flag.
///
/// Pushers block while full, poppers block while empty; `cancel` wakes
/// everyone and makes both operations fail immediately.
pub struct SolutionQueue<T> {
    inner: Mutex<Inner<T>>,
    push_cond: Condvar,
    pop_cond: Condvar,
    cancelled: AtomicBool,
}

impl<T> SolutionQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                cells: (0..capacity).map(|_| None).collect(),
                read_pos: 0,
                write_pos: 0,
            }),
            push_cond: Condvar::new(),
            pop_cond: Condvar::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// True when no items are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.read_pos == inner.write_pos
    }

    /// True once the queue was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Pushes an item, blocking while the queue is full. Returns false when
    /// cancelled or the timeout expires.
    pub fn push(&self, item: T, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock();
        let capacity = inner.cells.len();
        while inner.write_pos - inner.read_pos == capacity {
            if self.is_cancelled() {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.push_cond.wait_until(&mut inner, deadline).timed_out() {
                        return false;
                    }
                }
                None => self.push_cond.wait(&mut inner),
            }
        }
        if self.is_cancelled() {
            return false;
        }
        let slot = if inner.write_pos < capacity {
            inner.write_pos
        } else {
            inner.write_pos - capacity
        };
        inner.cells[slot] = Some(item);
        inner.write_pos += 1;
        self.pop_cond.notify_one();
        true
    }

    /// Pops an item, blocking while the queue is empty. Returns `None` when
    /// cancelled or the timeout expires.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock();
        while inner.read_pos == inner.write_pos {
            if self.is_cancelled() {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.pop_cond.wait_until(&mut inner, deadline).timed_out() {
                        return None;
                    }
                }
                None => self.pop_cond.wait(&mut inner),
            }
        }
        let capacity = inner.cells.len();
        let slot = inner.read_pos;
        let item = inner.cells[slot].take();
        inner.read_pos += 1;
        if inner.read_pos >= capacity {
            inner.read_pos -= capacity;
            inner.write_pos -= capacity;
        }
        self.push_cond.notify_one();
        item
    }

    /// Wakes all waiters; subsequent pushes and pops fail at once.
    pub fn cancel(&self) {
        let guard = self.inner.lock();
        self.cancelled.store(true, Ordering::Release);
        self.push_cond.notify_all();
        self.pop_cond.notify_all();
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let q = SolutionQueue::new(4);
        assert!(q.push(1u32, None));
        assert!(q.push(2, None));
        assert_eq!(q.pop(None), Some(1));
        assert_eq!(q.pop(None), Some(2));
    }

    #[test]
    fn blocks_then_drains_across_threads() {
        let q = Arc::new(SolutionQueue::new(2));
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    assert!(q.push(i, None));
                }
            })
        };
        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.push(q.pop(None).unwrap());
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn cancel_wakes_popper() {
        let q = Arc::new(SolutionQueue::<u32>::new(2));
        let popper = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.pop(None))
        };
        std::thread::sleep(Duration::from_millis(20));
        q.cancel();
        assert_eq!(popper.join().unwrap(), None);
        assert!(!q.push(1, None));
    }

    #[test]
    fn pop_timeout_expires() {
        let q = SolutionQueue::<u32>::new(1);
        assert_eq!(q.pop(Some(Duration::from_millis(10))), None);
    }
}
