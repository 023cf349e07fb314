//! The per-file write queue and its FIFO-fair lock.
//!
//! Producers (the API thread) and the consumer (the writer thread) both
//! mutate queue state and the file's activity flags. A plain mutex would
//! let a burst of short `put_var` calls starve the writer, so queue
//! transitions are ordered by a [`TicketLock`]: each acquirer draws a
//! ticket and is served strictly in ticket order.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// One queued write: everything the writer needs to post a buffered
/// non-blocking put for one variable hyperslab.
///
/// The descriptor owns `buf` from enqueue until the writer hands it to
/// the backend's buffered put (which copies it into the attached
/// buffer); the descriptor is dropped immediately after.
pub(crate) struct WriteDesc {
    pub var_id: i32,
    pub start: Vec<i64>,
    pub count: Vec<i64>,
    pub buf: Vec<u8>,
    /// Bytes this write will consume in the attached buffer.
    pub bufsize: i64,
}

/// FIFO of pending writes for one file.
pub(crate) struct AsyncQueue {
    items: Mutex<VecDeque<WriteDesc>>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        AsyncQueue {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, desc: WriteDesc) {
        self.items.lock().expect("queue mutex poisoned").push_back(desc);
    }

    pub fn remove(&self) -> Option<WriteDesc> {
        self.items.lock().expect("queue mutex poisoned").pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().expect("queue mutex poisoned").is_empty()
    }
}

struct TicketState {
    next: u64,
    serving: u64,
}

/// A FIFO-fair mutual-exclusion lock.
///
/// Acquirers draw monotonically increasing tickets and are admitted in
/// ticket order, so neither the producer nor the consumer side can be
/// starved under contention.
pub(crate) struct TicketLock {
    state: Mutex<TicketState>,
    cond: Condvar,
}

/// Guard for a held [`TicketLock`]; releases on drop.
pub(crate) struct TicketGuard<'a> {
    lock: &'a TicketLock,
}

impl TicketLock {
    pub fn new() -> Self {
        TicketLock {
            state: Mutex::new(TicketState {
                next: 0,
                serving: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> TicketGuard<'_> {
        let mut st = self.state.lock().expect("ticket mutex poisoned");
        let ticket = st.next;
        st.next += 1;
        while st.serving != ticket {
            st = self.cond.wait(st).expect("ticket mutex poisoned");
        }
        TicketGuard { lock: self }
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.lock.state.lock().expect("ticket mutex poisoned");
        st.serving += 1;
        self.lock.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn desc(tag: i32) -> WriteDesc {
        WriteDesc {
            var_id: tag,
            start: vec![0],
            count: vec![1],
            buf: vec![tag as u8],
            bufsize: 1,
        }
    }

    #[test]
    fn queue_is_fifo() {
        let q = AsyncQueue::new();
        assert!(q.is_empty());
        assert!(q.remove().is_none());

        q.add(desc(1));
        q.add(desc(2));
        q.add(desc(3));
        assert!(!q.is_empty());

        assert_eq!(q.remove().unwrap().var_id, 1);
        assert_eq!(q.remove().unwrap().var_id, 2);
        assert_eq!(q.remove().unwrap().var_id, 3);
        assert!(q.is_empty());
    }

    #[test]
    fn ticket_lock_excludes() {
        let lock = Arc::new(TicketLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let _g = lock.lock();
                    // non-atomic read-modify-write under the lock
                    let v = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }

    #[test]
    fn ticket_lock_serves_in_arrival_order() {
        let lock = Arc::new(TicketLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the lock while the waiters queue up, with generous gaps
        // so their ticket order is the spawn order.
        let held = lock.lock();
        let mut handles = Vec::new();
        for id in 0..4 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                let _g = lock.lock();
                order.lock().unwrap().push(id);
            }));
            thread::sleep(Duration::from_millis(50));
        }
        drop(held);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
