use std::{ops::Deref, time::Duration};

use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

use crate::threading::Thread;

/// Implementation of a heavy lock and condition variable implemented using
/// the primitives available from `parking_lot`. Currently we use a `Mutex`
/// and `Condvar`.
/// <p>
/// It is perfectly safe to use this throughout the runtime for locking. It
/// gives you the ability to lock and unlock, as well as wait and notify,
/// without using any other runtime functionality. In addition:
/// <ul>
/// <li>The lock can be claimed without blocking via `try_lock_no_handshake`,
///     which is what the handshake claim protocol relies on.</li>
/// <li>Waiting methods with the `with_handshake` suffix inform the thread
///     system that the waiter is blocked, so handshake operations targeting
///     it can be executed cooperatively while it sleeps. Methods without the
///     suffix either do not block (`notify()`, `notify_all()`) or block
///     without letting anyone know (`lock_no_handshake()` and
///     `wait_no_handshake()`). Not letting the thread system know that you
///     are blocked may cause handshakes against you to stall until you
///     unblock.</li>
/// <li>This struct does not provide mutable access to the protected data as
///     it is unsound, instead use `RefCell` to mutate the protected data.</li>
/// </ul>
pub struct Monitor<T> {
    mutex: Mutex<T>,
    cvar: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            mutex: Mutex::new(value),
            cvar: Condvar::new(),
        }
    }

    pub fn lock_no_handshake(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            monitor: self,
            guard: self.mutex.lock(),
        }
    }

    /// Non-blocking lock attempt. Returns `None` if another thread holds the
    /// monitor; never waits.
    pub fn try_lock_no_handshake(&self) -> Option<MonitorGuard<'_, T>> {
        self.mutex.try_lock().map(|guard| MonitorGuard {
            monitor: self,
            guard,
        })
    }

    pub fn notify(&self) {
        self.cvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }
}

pub struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn wait_no_handshake(&mut self) {
        self.monitor.cvar.wait(&mut self.guard);
    }

    pub fn wait_for_no_handshake(&mut self, timeout: Duration) -> WaitTimeoutResult {
        self.monitor.cvar.wait_for(&mut self.guard, timeout)
    }

    /// Wait on the monitor with `thread` (which must be the current thread)
    /// published as blocked, so that handshakes against it proceed while it
    /// sleeps. The monitor is released before leaving the blocked state and
    /// reacquired afterwards, so pending handshake operations are never
    /// processed while this monitor is held.
    pub fn wait_with_handshake(mut self, thread: &Thread) -> MonitorGuard<'a, T> {
        thread.enter_blocked();
        self.wait_no_handshake();
        let monitor = self.monitor;
        drop(self);
        thread.leave_blocked();
        monitor.lock_no_handshake()
    }

    /// Timed counterpart of [`wait_with_handshake`](Self::wait_with_handshake).
    pub fn wait_for_with_handshake(
        mut self,
        thread: &Thread,
        timeout: Duration,
    ) -> (MonitorGuard<'a, T>, WaitTimeoutResult) {
        thread.enter_blocked();
        let result = self.wait_for_no_handshake(timeout);
        let monitor = self.monitor;
        drop(self);
        thread.leave_blocked();
        (monitor.lock_no_handshake(), result)
    }

    pub fn notify(&self) {
        self.monitor.cvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.monitor.cvar.notify_all();
    }

    pub fn monitor(&self) -> &Monitor<T> {
        self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_lock_fails_while_held() {
        let monitor = Arc::new(Monitor::new(()));
        let guard = monitor.lock_no_handshake();
        assert!(monitor.try_lock_no_handshake().is_none());
        drop(guard);
        assert!(monitor.try_lock_no_handshake().is_some());
    }

    #[test]
    fn timed_wait_times_out() {
        let monitor = Monitor::new(());
        let mut guard = monitor.lock_no_handshake();
        let result = guard.wait_for_no_handshake(Duration::from_millis(10));
        assert!(result.timed_out());
    }

    #[test]
    fn notify_wakes_waiter() {
        let monitor = Arc::new(Monitor::new(std::cell::Cell::new(false)));
        let m2 = monitor.clone();
        let waiter = std::thread::spawn(move || {
            let mut guard = m2.lock_no_handshake();
            while !guard.get() {
                guard.wait_no_handshake();
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        let guard = monitor.lock_no_handshake();
        guard.set(true);
        guard.notify_all();
        drop(guard);
        waiter.join().unwrap();
    }
}
