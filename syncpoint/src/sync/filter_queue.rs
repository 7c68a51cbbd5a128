use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// An intrusive stack with lock-free pushes and predicate-based pops.
///
/// Pushes may be performed concurrently by any number of threads without
/// taking a lock; this is what lets a running thread enqueue a handshake
/// operation on another thread without ever blocking. Everything else
/// (`pop_with`, `contains`) must be serialized by the owner's lock: only the
/// head pointer is ever raced by concurrent pushes, interior links are
/// written solely by the (locked) popper and pushers never traverse.
///
/// Elements are popped oldest-first, so the stack behaves as a FIFO queue
/// for a consumer that filters with `pop_with`.
pub struct FilterQueue<T> {
    head: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for FilterQueue<T> {}
unsafe impl<T: Send> Sync for FilterQueue<T> {}

impl<T> FilterQueue<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Lock-free; safe to call from any thread at any time.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe {
                (*node).next = head;
            }
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Lock-free: reads only the head pointer, never traverses.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }

    /// Pops the oldest element matching `f`. The caller must hold the
    /// owner's lock.
    pub fn pop_with<F: Fn(&T) -> bool>(&self, f: F) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // Find the last (oldest) matching node and its predecessor in
            // the snapshot rooted at `head`. Pushes that race with us only
            // stack newer nodes on top, which we deliberately ignore.
            let mut found: *mut Node<T> = ptr::null_mut();
            let mut found_prev: *mut Node<T> = ptr::null_mut();
            let mut prev: *mut Node<T> = ptr::null_mut();
            let mut cur = head;
            while !cur.is_null() {
                unsafe {
                    if f(&(*cur).value) {
                        found = cur;
                        found_prev = prev;
                    }
                    prev = cur;
                    cur = (*cur).next;
                }
            }
            if found.is_null() {
                return None;
            }
            if found == head {
                let next = unsafe { (*found).next };
                if self
                    .head
                    .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    // A push landed on top of the node we want; retry with
                    // the new head, our node is no longer first.
                    continue;
                }
            } else {
                unsafe {
                    (*found_prev).next = (*found).next;
                }
            }
            let node = unsafe { Box::from_raw(found) };
            return Some(node.value);
        }
    }

    /// The caller must hold the owner's lock.
    pub fn contains<F: Fn(&T) -> bool>(&self, f: F) -> bool {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            unsafe {
                if f(&(*cur).value) {
                    return true;
                }
                cur = (*cur).next;
            }
        }
        false
    }
}

impl<T> Drop for FilterQueue<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_oldest_first() {
        let queue = FilterQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop_with(|_| true), Some(1));
        assert_eq!(queue.pop_with(|_| true), Some(2));
        assert_eq!(queue.pop_with(|_| true), Some(3));
        assert_eq!(queue.pop_with(|_| true), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn filter_skips_non_matching() {
        let queue = FilterQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        queue.push(4);
        assert_eq!(queue.pop_with(|v| v % 2 == 0), Some(2));
        assert_eq!(queue.pop_with(|v| v % 2 == 0), Some(4));
        assert_eq!(queue.pop_with(|v| v % 2 == 0), None);
        // odd entries are untouched, in order
        assert!(queue.contains(|v| *v == 1));
        assert_eq!(queue.pop_with(|_| true), Some(1));
        assert_eq!(queue.pop_with(|_| true), Some(3));
    }

    #[test]
    fn concurrent_pushes_are_all_observed() {
        use std::sync::Arc;
        let queue = Arc::new(FilterQueue::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let q = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    q.push(t * 100 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = 0;
        while queue.pop_with(|_| true).is_some() {
            seen += 1;
        }
        assert_eq!(seen, 400);
    }
}
