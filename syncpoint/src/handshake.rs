//! Cross-thread handshakes.
//!
//! A handshake asks a specific thread (or every live thread) to execute a
//! closure at its next safe point, without a global stop-the-world pause.
//! The requester does not merely wait: while the operation is pending it
//! cooperates, repeatedly trying to *claim* the target and run the closure
//! on its behalf whenever the target is observed in a safe state. The claim
//! protocol guarantees at most one executor per target at a time; the
//! release/acquire pair around the pending count guarantees that everything
//! the closure wrote is visible to the requester once `execute` returns.

use std::{
    sync::{
        atomic::{fence, AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    sync::{FilterQueue, Monitor, MonitorGuard},
    threading::{try_current_thread, Thread, ThreadState},
    Options, Runtime,
};

/// A unit of work to be executed on a target thread at one of its safe
/// points. Implementations must not block for long and must not issue
/// further handshakes against the thread executing them; they may run on the
/// target itself, on the requester, or on an unrelated cooperating thread.
pub trait HandshakeClosure: Send + Sync {
    /// Diagnostic name, used in trace lines.
    fn name(&self) -> &str;

    fn do_thread(&self, thread: &Thread);

    /// True for the internal self-suspension request; such operations are
    /// only ever executed by the target itself.
    fn is_suspend(&self) -> bool {
        false
    }
}

/// Outcome of one cooperative processing attempt against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// The target has no operation another thread could execute.
    NoOperation,
    /// The target's published state does not permit acting on it right now.
    NotSafe,
    /// Another executor already holds the target's claim lock.
    ClaimFailed,
    /// An operation was executed, but not the caller's own.
    Processed,
    /// The caller's own operation was executed.
    Succeeded,
}

impl ProcessResult {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            ProcessResult::NoOperation => 0,
            ProcessResult::NotSafe => 1,
            ProcessResult::ClaimFailed => 2,
            ProcessResult::Processed => 3,
            ProcessResult::Succeeded => 4,
        }
    }
}

/// One pending cross-thread request.
///
/// Synchronous operations are held by the requester until the pending count
/// reaches zero; asynchronous operations are owned by the queues they sit in
/// and dropped by whichever thread completes them.
pub struct HandshakeOperation {
    closure: Arc<dyn HandshakeClosure>,
    /// Number of targets that have not executed the closure yet. Decremented
    /// with release ordering on completion; read with acquire ordering by
    /// waiters, so closure side effects happen-before the observed zero.
    pending: AtomicI32,
    asynchronous: bool,
    /// Target thread id, `None` for a broadcast.
    target: Option<u64>,
    /// Originating thread id, for diagnostics only.
    requester: Option<u64>,
}

impl HandshakeOperation {
    fn new(
        closure: Arc<dyn HandshakeClosure>,
        asynchronous: bool,
        target: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            closure,
            pending: AtomicI32::new(1),
            asynchronous,
            target,
            requester: try_current_thread().map(|t| t.id()),
        })
    }

    pub fn name(&self) -> &str {
        self.closure.name()
    }

    fn is_async(&self) -> bool {
        self.asynchronous
    }

    fn is_suspend(&self) -> bool {
        self.closure.is_suspend()
    }

    fn is_completed(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    /// Broadcasts start with a count of 1 and adjust it to the real target
    /// count once the thread set has been enumerated.
    fn add_target_count(&self, n: i32) {
        self.pending.fetch_add(n, Ordering::Relaxed);
    }

    fn prepare(&self, handshakee: &Thread) {
        debug_assert_ne!(handshakee.state(), ThreadState::Terminated);
        log::trace!(
            "executing handshake {} on thread {} (requested by {:?})",
            self.name(),
            handshakee.name(),
            self.requester
        );
    }

    fn do_thread_and_complete(&self, thread: &Thread) {
        self.closure.do_thread(thread);
        let previous = self.pending.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "handshake pending count went negative");
    }

    /// Completion without execution, for targets observed terminated.
    fn complete_trivially(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "handshake pending count went negative");
    }
}

const NO_EXECUTOR: u64 = 0;

/// Per-thread handshake state: the operation queue, the claim lock, and the
/// suspension flags. Owned by the target thread; pushed to lock-free by
/// anyone, drained under the lock by at most one executor at a time.
pub(crate) struct HandshakeState {
    queue: FilterQueue<Arc<HandshakeOperation>>,
    lock: Monitor<()>,
    /// Which thread is currently executing an operation on behalf of this
    /// target. Diagnostics only; mutual exclusion comes from `lock`.
    active_executor: AtomicU64,
    /// Count of queued operations another thread may execute (everything
    /// except asynchronous operations). Read lock-free as the first step of
    /// the claim protocol.
    non_self_executable: AtomicUsize,
    /// True while the target has an active self-suspension in effect.
    suspended: AtomicBool,
    /// True while an asynchronous self-suspension handshake is outstanding,
    /// preventing duplicate suspend requests.
    async_suspend_requested: AtomicBool,
}

impl HandshakeState {
    pub(crate) fn new() -> Self {
        Self {
            queue: FilterQueue::new(),
            lock: Monitor::new(()),
            active_executor: AtomicU64::new(NO_EXECUTOR),
            non_self_executable: AtomicUsize::new(0),
            suspended: AtomicBool::new(false),
            async_suspend_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> &Monitor<()> {
        &self.lock
    }

    /// Register `op` against `handshakee`. The queue push is lock-free so a
    /// running requester never blocks here; arming the poll flag afterwards
    /// is what publishes the operation to the target. The SeqCst fence pairs
    /// with the one in `maybe_disarm` so the flag can never end up disarmed
    /// with a non-empty queue.
    pub(crate) fn push_operation(&self, handshakee: &Thread, op: Arc<HandshakeOperation>) {
        debug_assert!(op.target.is_none() || op.target == Some(handshakee.id()));
        let self_only = op.is_async();
        self.queue.push(op);
        if !self_only {
            self.non_self_executable.fetch_add(1, Ordering::SeqCst);
        }
        fence(Ordering::SeqCst);
        handshakee.arm_poll();
    }

    fn have_non_self_executable_operation(&self) -> bool {
        self.non_self_executable.load(Ordering::Acquire) > 0
    }

    /// Disarm the target's poll flag if its queue has drained. Requires the
    /// state lock. A push racing with the disarm re-arms the flag, so we
    /// re-check and restore it ourselves if the push's own arm could have
    /// been overwritten.
    fn maybe_disarm(&self, handshakee: &Thread) {
        if self.queue.is_empty() {
            handshakee.disarm_poll();
            fence(Ordering::SeqCst);
            if !self.queue.is_empty() {
                handshakee.arm_poll();
            }
        }
    }

    /// One cooperative processing attempt: claim the target and execute the
    /// oldest operation another thread is allowed to run.
    ///
    /// The cheap pre-checks are ordered deliberately: first observe that an
    /// operation is pending, then (after an acquire fence) that the poll flag
    /// is armed; this prevents acting on an enqueue whose poll-arm store has
    /// not become visible yet. The claim is a non-blocking try-lock, and the
    /// safe-state check is repeated under the lock because the target may
    /// have woken between the check and the claim.
    pub(crate) fn try_process(
        &self,
        handshakee: &Thread,
        match_op: &Arc<HandshakeOperation>,
    ) -> ProcessResult {
        if !self.have_non_self_executable_operation() {
            return ProcessResult::NoOperation;
        }
        fence(Ordering::Acquire);
        if !handshakee.poll_armed() {
            return ProcessResult::NotSafe;
        }
        if !handshakee.state().can_process_handshake() {
            return ProcessResult::NotSafe;
        }
        let Some(_guard) = self.lock.try_lock_no_handshake() else {
            return ProcessResult::ClaimFailed;
        };
        if !handshakee.state().can_process_handshake() {
            return ProcessResult::NotSafe;
        }
        let Some(op) = self.queue.pop_with(|op| !op.is_async()) else {
            return ProcessResult::NoOperation;
        };
        self.non_self_executable.fetch_sub(1, Ordering::SeqCst);

        let executor = try_current_thread().map_or(NO_EXECUTOR, |t| t.id());
        self.active_executor.store(executor, Ordering::Relaxed);
        if handshakee.state() == ThreadState::Terminated {
            log::trace!(
                "thread {} exited before handshake {}; completing trivially",
                handshakee.name(),
                op.name()
            );
            op.complete_trivially();
        } else {
            op.prepare(handshakee);
            op.do_thread_and_complete(handshakee);
        }
        self.active_executor.store(NO_EXECUTOR, Ordering::Relaxed);
        self.maybe_disarm(handshakee);

        if Arc::ptr_eq(&op, match_op) {
            ProcessResult::Succeeded
        } else {
            ProcessResult::Processed
        }
    }

    /// Drain the queue on behalf of the target itself, called from its poll
    /// checks. No claim race is needed: cooperative executors use a try-lock
    /// which simply fails while we hold the lock. With `allow_suspend` false,
    /// suspension requests are left queued (and the poll flag stays armed)
    /// for a later poll at a suspension-capable call site.
    pub(crate) fn process_by_self(&self, handshakee: &Thread, allow_suspend: bool) {
        debug_assert!(try_current_thread().is_some_and(|t| t.id() == handshakee.id()));
        let mut guard = self.lock.lock_no_handshake();
        loop {
            let op = self
                .queue
                .pop_with(|op| allow_suspend || !op.is_suspend());
            let Some(op) = op else {
                self.maybe_disarm(handshakee);
                return;
            };
            if op.is_async() && op.is_suspend() {
                op.do_thread_and_complete(handshakee);
                self.do_self_suspend(handshakee, &mut guard);
                self.async_suspend_requested.store(false, Ordering::Release);
            } else {
                if !op.is_async() {
                    self.non_self_executable.fetch_sub(1, Ordering::SeqCst);
                }
                self.active_executor.store(handshakee.id(), Ordering::Relaxed);
                op.prepare(handshakee);
                op.do_thread_and_complete(handshakee);
                self.active_executor.store(NO_EXECUTOR, Ordering::Relaxed);
            }
        }
    }

    /// Park until resumed. The state lock doubles as the condition variable;
    /// waiting releases it, so cooperative executors can still claim us and
    /// run synchronous handshakes while we are suspended.
    fn do_self_suspend(&self, handshakee: &Thread, guard: &mut MonitorGuard<'_, ()>) {
        log::trace!("thread {} self-suspending", handshakee.name());
        while self.suspended.load(Ordering::Acquire) {
            unsafe {
                handshakee.set_exec_status(ThreadState::Blocked);
            }
            guard.wait_no_handshake();
            unsafe {
                handshakee.set_exec_status(ThreadState::Running);
            }
        }
        log::trace!("thread {} resumed", handshakee.name());
    }

    /// Runs as the body of the synchronous suspend handshake, so the caller
    /// (whichever executor) holds the state lock. Marks the target suspended
    /// and queues the asynchronous stop-in-your-tracks request, unless one is
    /// already outstanding.
    fn suspend_with_handshake(&self, handshakee: &Thread) -> bool {
        if handshakee.state() == ThreadState::Terminated {
            return false;
        }
        if self.async_suspend_requested.load(Ordering::Acquire) {
            // A self-suspension handshake is already queued (or the target is
            // already parked); just keep the suspended flag raised.
            self.suspended.store(true, Ordering::Release);
            return true;
        }
        debug_assert!(!self.suspended.load(Ordering::Acquire));
        self.suspended.store(true, Ordering::Release);
        self.async_suspend_requested.store(true, Ordering::Release);
        let op = HandshakeOperation::new(
            Arc::new(SelfSuspendClosure),
            true,
            Some(handshakee.id()),
        );
        self.push_operation(handshakee, op);
        true
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Called on thread exit with the registry entry already removed. Flushes
    /// the queue so requesters parked on any of these operations observe
    /// trivial completion; asynchronous operations are simply dropped.
    pub(crate) fn thread_exit(&self, handshakee: &Thread) {
        let _guard = self.lock.lock_no_handshake();
        unsafe {
            handshakee.set_exec_status(ThreadState::Terminated);
        }
        while let Some(op) = self.queue.pop_with(|_| true) {
            if !op.is_async() {
                self.non_self_executable.fetch_sub(1, Ordering::SeqCst);
            }
            log::trace!(
                "dropping handshake {} queued against exiting thread {}",
                op.name(),
                handshakee.name()
            );
            op.complete_trivially();
        }
        self.maybe_disarm(handshakee);
        // A terminated thread cannot stay suspended.
        self.suspended.store(false, Ordering::Release);
    }

    fn queue_contains(&self, op: &Arc<HandshakeOperation>) -> bool {
        self.queue.contains(|other| Arc::ptr_eq(other, op))
    }
}

/// The internal asynchronous operation that makes a suspension take effect;
/// the park itself happens in `process_by_self`, which recognizes the
/// operation by its `is_suspend` flag.
struct SelfSuspendClosure;

impl HandshakeClosure for SelfSuspendClosure {
    fn name(&self) -> &str {
        "AsyncSelfSuspend"
    }

    fn do_thread(&self, _thread: &Thread) {}

    fn is_suspend(&self) -> bool {
        true
    }
}

const MAX_SPIN_BUDGET_US: u64 = 10_000;

/// Adaptive waiting for handshake requesters: spin while cooperative
/// processing is making progress anywhere, sleep briefly once it stalls.
/// This is purely a latency/CPU tradeoff; correctness comes entirely from
/// the claim protocol.
struct SpinYield {
    results: [usize; ProcessResult::COUNT],
    checked: [usize; ProcessResult::COUNT],
    last_progress: Instant,
    max_spin: Duration,
}

impl SpinYield {
    fn new(options: &Options) -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        // Spinning is pointless on a single hardware thread.
        let max_spin = if cpus > 1 {
            Duration::from_micros(
                (options.handshake_spin_budget_us * cpus as u64).min(MAX_SPIN_BUDGET_US),
            )
        } else {
            Duration::ZERO
        };
        Self {
            results: [0; ProcessResult::COUNT],
            checked: [0; ProcessResult::COUNT],
            last_progress: Instant::now(),
            max_spin,
        }
    }

    fn add_result(&mut self, result: ProcessResult) {
        self.results[result.index()] += 1;
    }

    fn process(&mut self, me: Option<&Thread>) {
        if self.results != self.checked {
            // The outcome histogram moved since we last looked: somebody is
            // making progress, keep spinning.
            self.checked = self.results;
            self.last_progress = Instant::now();
            std::hint::spin_loop();
            return;
        }
        if self.last_progress.elapsed() < self.max_spin {
            std::hint::spin_loop();
            return;
        }
        blocked_short_sleep(me, Duration::from_millis(1));
        self.last_progress = Instant::now();
    }
}

/// Sleep briefly with the waiter published as blocked, so handshakes against
/// it proceed in the meantime. Suspension requests are deliberately not
/// honored here: a requester must not park indefinitely in the middle of its
/// own handshake.
fn blocked_short_sleep(me: Option<&Thread>, duration: Duration) {
    match me {
        Some(thread) => {
            unsafe {
                thread.set_exec_status(ThreadState::Blocked);
            }
            std::thread::sleep(duration);
            unsafe {
                thread.set_exec_status(ThreadState::Running);
            }
            fence(Ordering::SeqCst);
            if thread.poll_armed() {
                thread.handshake_state().process_by_self(thread, false);
            }
        }
        None => std::thread::sleep(duration),
    }
}

/// Execute `closure` on `target` at its next safe point and wait for
/// completion. Once this returns, everything the closure wrote is visible to
/// the caller without further synchronization.
///
/// The caller participates while waiting: it keeps trying to run the
/// operation on the target's behalf, and keeps serving handshakes directed
/// at itself, so two threads handshaking each other cannot deadlock.
pub fn execute(runtime: &Runtime, closure: Arc<dyn HandshakeClosure>, target: &Arc<Thread>) {
    // An unstarted thread never polls and never reaches a claimable state,
    // so a handshake against it could not make progress.
    debug_assert_ne!(
        target.state(),
        ThreadState::New,
        "handshake target {} was never started",
        target.name()
    );
    let current = try_current_thread();
    let op = HandshakeOperation::new(closure, false, Some(target.id()));

    if current.as_ref().is_some_and(|t| t.id() == target.id()) {
        // A thread handshaking itself is trivially at a safe point. The
        // state lock is still taken so closures that mutate handshake state
        // (suspension flags) stay serialized with resume().
        let _guard = target.handshake_state().lock().lock_no_handshake();
        op.prepare(target);
        op.do_thread_and_complete(target);
        debug_assert!(op.is_completed());
        return;
    }

    target.handshake_state().push_operation(target, op.clone());

    let start = Instant::now();
    let mut spin = SpinYield::new(runtime.options());
    while !op.is_completed() {
        let result = target.handshake_state().try_process(target, &op);
        spin.add_result(result);
        if let Some(me) = current.as_deref() {
            if me.poll_armed() {
                me.handshake_state().process_by_self(me, false);
            }
        }
        spin.process(current.as_deref());
        check_handshake_timeout(runtime, start, &op);
    }
    log::trace!("handshake {} on thread {} completed", op.name(), target.name());
}

/// Execute `closure` on every live registered thread and wait until all of
/// them have run it (threads that terminate in the meantime count as
/// trivially done). The requester, if registered, is included and runs the
/// closure on itself.
pub fn execute_all(runtime: &Runtime, closure: Arc<dyn HandshakeClosure>) {
    let current = try_current_thread();
    let threads = runtime.registry().threads();
    let op = HandshakeOperation::new(closure, false, None);
    op.add_target_count(threads.len() as i32 - 1);
    log::trace!("handshaking {} threads with {}", threads.len(), op.name());

    for thread in &threads {
        thread.handshake_state().push_operation(thread, op.clone());
    }

    let start = Instant::now();
    let mut spin = SpinYield::new(runtime.options());
    while !op.is_completed() {
        for thread in &threads {
            let result = thread.handshake_state().try_process(thread, &op);
            spin.add_result(result);
        }
        if let Some(me) = current.as_deref() {
            if me.poll_armed() {
                me.handshake_state().process_by_self(me, false);
            }
        }
        spin.process(current.as_deref());
        check_handshake_timeout(runtime, start, &op);
    }
    log::trace!("broadcast handshake {} completed", op.name());
}

/// Fire-and-forget: queue `closure` for execution at the target's next safe
/// point. Only the target itself executes asynchronous operations; if it
/// terminates first the operation is dropped without running.
pub fn execute_async(closure: Arc<dyn HandshakeClosure>, target: &Arc<Thread>) {
    debug_assert_ne!(
        target.state(),
        ThreadState::New,
        "handshake target {} was never started",
        target.name()
    );
    if target.state() == ThreadState::Terminated {
        log::debug!(
            "dropping async handshake {} for terminated thread {}",
            closure.name(),
            target.name()
        );
        return;
    }
    let op = HandshakeOperation::new(closure, true, Some(target.id()));
    target.handshake_state().push_operation(target, op);
}

struct SuspendThreadClosure {
    did_suspend: AtomicBool,
}

impl HandshakeClosure for SuspendThreadClosure {
    fn name(&self) -> &str {
        "SuspendThread"
    }

    fn do_thread(&self, thread: &Thread) {
        let suspended = thread.handshake_state().suspend_with_handshake(thread);
        self.did_suspend.store(suspended, Ordering::Relaxed);
    }
}

/// Suspend `target` at its next suspension-capable safe point. Returns true
/// if the target is suspended once the request has been processed (including
/// when it was already suspended); false if the target has terminated.
pub fn suspend(runtime: &Runtime, target: &Arc<Thread>) -> bool {
    let closure = Arc::new(SuspendThreadClosure {
        did_suspend: AtomicBool::new(false),
    });
    execute(runtime, closure.clone(), target);
    closure.did_suspend.load(Ordering::Relaxed)
}

/// Resume a suspended thread. Returns false if the target was not suspended.
pub fn resume(target: &Arc<Thread>) -> bool {
    let state = target.handshake_state();
    let guard = state.lock().lock_no_handshake();
    if !state.is_suspended() {
        return false;
    }
    state.suspended.store(false, Ordering::Release);
    guard.notify_all();
    log::trace!("thread {} resume requested", target.name());
    true
}

/// Handshake starvation is a correctness bug somewhere in the runtime, not a
/// transient condition: dump which threads still hold the operation and give
/// up.
fn check_handshake_timeout(runtime: &Runtime, start: Instant, op: &Arc<HandshakeOperation>) {
    let timeout_ms = runtime.options().handshake_timeout_ms;
    if timeout_ms <= 0 {
        return;
    }
    if start.elapsed() < Duration::from_millis(timeout_ms as u64) {
        return;
    }
    log::error!("handshake {} timed out after {timeout_ms} ms", op.name());
    for thread in runtime.registry().threads() {
        let state = thread.handshake_state();
        let _guard = state.lock().lock_no_handshake();
        if state.queue_contains(op) {
            log::error!(
                "thread {} (id {}, state {:?}) has not processed handshake {}",
                thread.name(),
                thread.id(),
                thread.state(),
                op.name()
            );
        }
    }
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_yield_resets_window_on_progress() {
        let options = Options::default();
        let mut spin = SpinYield::new(&options);
        spin.add_result(ProcessResult::NotSafe);
        spin.process(None);
        assert_eq!(spin.results, spin.checked);
        // no new result: the next process() call sees a stalled histogram
        let before = spin.last_progress;
        spin.add_result(ProcessResult::Processed);
        spin.process(None);
        assert!(spin.last_progress >= before);
    }

    #[test]
    fn process_result_histogram_indices_are_distinct() {
        let all = [
            ProcessResult::NoOperation,
            ProcessResult::NotSafe,
            ProcessResult::ClaimFailed,
            ProcessResult::Processed,
            ProcessResult::Succeeded,
        ];
        let mut seen = [false; ProcessResult::COUNT];
        for result in all {
            assert!(!seen[result.index()]);
            seen[result.index()] = true;
        }
    }
}
