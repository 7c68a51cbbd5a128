//! The background service thread and its time-ordered task queue.
//!
//! Unlike handshakes there is no cross-thread claim race here: the service
//! thread owns the queue exclusively, guarded by a single monitor, and
//! simply sleeps until the earliest task is due. Tasks may reschedule
//! themselves from within their own execution.

use std::{
    cell::RefCell,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    sync::Monitor,
    threading::{current_thread, Thread},
    Runtime,
};

/// A unit of background work with a diagnostic name. Executed on the service
/// thread, outside the queue lock; a panic in a task is a bug in the task
/// and takes the process down, there is no recovery path.
pub trait ServiceTask: Send {
    fn name(&self) -> &str;

    /// Run the task. Call [`TaskExecutionContext::reschedule`] to run again
    /// after a delay; otherwise the task is dropped when this returns.
    fn execute(&mut self, ctx: &mut TaskExecutionContext);
}

/// Handed to a task during execution; the only way to reschedule, so a
/// reschedule request is valid exactly when the task itself is running.
pub struct TaskExecutionContext {
    reschedule: Option<Duration>,
}

impl TaskExecutionContext {
    fn new() -> Self {
        Self { reschedule: None }
    }

    /// Ask the service thread to run this task again `delay` from now.
    pub fn reschedule(&mut self, delay: Duration) {
        self.reschedule = Some(delay);
    }

    fn take_reschedule(&mut self) -> Option<Duration> {
        self.reschedule.take()
    }
}

pub(crate) struct ScheduledTask {
    /// Milliseconds since the service thread's epoch. Immutable while the
    /// entry is linked into the queue.
    due_ms: u64,
    task: Box<dyn ServiceTask>,
}

struct TaskNode {
    entry: ScheduledTask,
    next: Option<Box<TaskNode>>,
}

/// A time-ordered singly-linked queue. The queue owns its nodes; due times
/// are strictly non-decreasing from head to tail, so the earliest task is an
/// O(1) peek while insertion is a linear scan (the number of background
/// tasks is small).
pub(crate) struct OrderedTaskQueue {
    head: Option<Box<TaskNode>>,
}

impl OrderedTaskQueue {
    fn new() -> Self {
        Self { head: None }
    }

    fn add_ordered(&mut self, entry: ScheduledTask) {
        let mut cursor = &mut self.head;
        while cursor.as_ref().is_some_and(|n| n.entry.due_ms <= entry.due_ms) {
            cursor = &mut cursor.as_mut().unwrap().next;
        }
        let next = cursor.take();
        *cursor = Some(Box::new(TaskNode { entry, next }));
        debug_assert!(self.is_sorted());
    }

    fn front(&self) -> &ScheduledTask {
        &self
            .head
            .as_ref()
            .expect("front() called on an empty task queue")
            .entry
    }

    fn remove_front(&mut self) -> ScheduledTask {
        let node = self
            .head
            .take()
            .expect("remove_front() called on an empty task queue");
        self.head = node.next;
        node.entry
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn is_sorted(&self) -> bool {
        let mut cursor = &self.head;
        let mut last = 0;
        while let Some(node) = cursor {
            if node.entry.due_ms < last {
                return false;
            }
            last = node.entry.due_ms;
            cursor = &node.next;
        }
        true
    }
}

struct ServiceQueue {
    queue: OrderedTaskQueue,
    stopping: bool,
}

struct ServiceInner {
    monitor: Monitor<RefCell<ServiceQueue>>,
    epoch: Instant,
}

impl ServiceInner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Owns the task queue and a dedicated registered runtime thread that waits
/// (handshake-safe) until the earliest task is due and runs it.
pub struct ServiceThread {
    inner: Arc<ServiceInner>,
    join: parking_lot::Mutex<Option<JoinHandle<Option<()>>>>,
}

impl ServiceThread {
    pub(crate) fn start(runtime: &Arc<Runtime>) -> Self {
        let inner = Arc::new(ServiceInner {
            monitor: Monitor::new(RefCell::new(ServiceQueue {
                queue: OrderedTaskQueue::new(),
                stopping: false,
            })),
            epoch: Instant::now(),
        });
        let thread = Thread::new("service thread");
        let run_inner = inner.clone();
        let join = thread.start(runtime, move || Self::run_loop(&run_inner));
        Self {
            inner,
            join: parking_lot::Mutex::new(Some(join)),
        }
    }

    /// Register `task` to run `initial_delay` from now. Registration after
    /// the service thread has stopped drops the task; shutdown races are
    /// expected and benign.
    pub fn register_task(&self, task: Box<dyn ServiceTask>, initial_delay: Duration) {
        let guard = self.inner.monitor.lock_no_handshake();
        let mut state = guard.borrow_mut();
        if state.stopping {
            log::debug!(
                "service thread has stopped, dropping task {}",
                task.name()
            );
            return;
        }
        let due_ms = self
            .inner
            .now_ms()
            .saturating_add(initial_delay.as_millis() as u64);
        log::trace!("registering task {} due at {due_ms} ms", task.name());
        state.queue.add_ordered(ScheduledTask { due_ms, task });
        drop(state);
        // The service thread may be sleeping for a far-future task; wake it
        // so it re-computes its wait.
        guard.notify();
    }

    /// Stop the service thread and wait for it to exit. Tasks still queued
    /// are dropped; further registrations become no-ops.
    pub fn stop(&self) {
        {
            let guard = self.inner.monitor.lock_no_handshake();
            guard.borrow_mut().stopping = true;
            guard.notify_all();
        }
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(inner: &ServiceInner) {
        let thread = current_thread();
        while let Some(mut scheduled) = Self::wait_for_task(inner, &thread) {
            log::trace!("running task {}", scheduled.task.name());
            let mut ctx = TaskExecutionContext::new();
            scheduled.task.execute(&mut ctx);
            if let Some(delay) = ctx.take_reschedule() {
                // Self-reschedule: no notify needed, we are the only waiter.
                let due_ms = inner.now_ms().saturating_add(delay.as_millis() as u64);
                let guard = inner.monitor.lock_no_handshake();
                guard.borrow_mut().queue.add_ordered(ScheduledTask {
                    due_ms,
                    task: scheduled.task,
                });
            }
            thread.poll();
        }
        log::debug!("service thread stopping");
    }

    /// Block until the earliest task is due and pop it, or return `None`
    /// when asked to stop. Waits are handshake-safe, and timed waits are
    /// computed from a truncated "now" so they round up, never down. A
    /// premature wake just loops and waits again, never with a zero timeout.
    fn wait_for_task(inner: &ServiceInner, thread: &Arc<Thread>) -> Option<ScheduledTask> {
        let mut guard = inner.monitor.lock_no_handshake();
        loop {
            let wait_for = {
                let mut state = guard.borrow_mut();
                if state.stopping {
                    return None;
                }
                if state.queue.is_empty() {
                    None
                } else {
                    let due_ms = state.queue.front().due_ms;
                    let now_ms = inner.now_ms();
                    if due_ms <= now_ms {
                        return Some(state.queue.remove_front());
                    }
                    Some(Duration::from_millis(due_ms - now_ms))
                }
            };
            guard = match wait_for {
                Some(delay) => guard.wait_for_with_handshake(thread, delay).0,
                None => guard.wait_with_handshake(thread),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedTask(&'static str);

    impl ServiceTask for NamedTask {
        fn name(&self) -> &str {
            self.0
        }

        fn execute(&mut self, _ctx: &mut TaskExecutionContext) {}
    }

    fn entry(due_ms: u64) -> ScheduledTask {
        ScheduledTask {
            due_ms,
            task: Box::new(NamedTask("test task")),
        }
    }

    #[test]
    fn add_ordered_keeps_due_times_non_decreasing() {
        let mut queue = OrderedTaskQueue::new();
        for due in [50, 10, 30, 10, 70, 0] {
            queue.add_ordered(entry(due));
        }
        let mut last = 0;
        while !queue.is_empty() {
            let front = queue.front().due_ms;
            assert!(front >= last);
            last = front;
            assert_eq!(queue.remove_front().due_ms, front);
        }
    }

    #[test]
    fn interleaved_adds_and_removes_stay_sorted() {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut queue = OrderedTaskQueue::new();
        let mut last_popped = 0;
        for _ in 0..500 {
            if rng.random_range(0..3) > 0 || queue.is_empty() {
                // removals only ever pop the minimum, so anything not yet
                // popped may still be inserted ahead of the current front
                queue.add_ordered(entry(rng.random_range(0..1000)));
                last_popped = 0;
            } else {
                let due = queue.remove_front().due_ms;
                assert!(due >= last_popped);
                last_popped = due;
            }
        }
    }

    #[test]
    fn equal_due_times_preserve_insertion_order() {
        struct Tagged(&'static str);
        impl ServiceTask for Tagged {
            fn name(&self) -> &str {
                self.0
            }
            fn execute(&mut self, _ctx: &mut TaskExecutionContext) {}
        }
        let mut queue = OrderedTaskQueue::new();
        queue.add_ordered(ScheduledTask {
            due_ms: 5,
            task: Box::new(Tagged("first")),
        });
        queue.add_ordered(ScheduledTask {
            due_ms: 5,
            task: Box::new(Tagged("second")),
        });
        assert_eq!(queue.remove_front().task.name(), "first");
        assert_eq!(queue.remove_front().task.name(), "second");
    }

    #[test]
    #[should_panic(expected = "empty task queue")]
    fn front_on_empty_queue_panics() {
        let queue = OrderedTaskQueue::new();
        let _ = queue.front();
    }
}
