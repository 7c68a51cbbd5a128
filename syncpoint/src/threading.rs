use std::{
    cell::RefCell,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{fence, AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use atomic::Atomic;

use crate::{handshake::HandshakeState, sync::Monitor, Runtime};

/// Threads use a state machine to indicate their current state and how they
/// should be treated in case of asynchronous requests like handshakes. The
/// published state is what lets one thread decide, without stopping the
/// world, whether it may act on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadState {
    /// Thread has not yet started. This state holds right up until just
    /// before we call `thread::spawn()`.
    #[default]
    New,
    /// Thread is executing ordinary code. Its stack and state must be
    /// assumed to be changing under foot, so nobody may act on it; requests
    /// are deferred until the thread reaches a safe point (a [`poll`]
    /// (Thread::poll) or a blocking transition).
    Running,
    /// Thread is parked in a monitor wait, a cooperative sleep, or a
    /// self-suspension. Its published state is stable until it transitions
    /// back through [`leave_blocked`](Thread::leave_blocked), which first
    /// settles any pending handshake operations. Observe that it is always
    /// safe for a handshake executor that has claimed the thread's state
    /// lock to act on a `Blocked` thread.
    Blocked,
    /// Thread has died. It will never execute user code again; operations
    /// still queued against it complete trivially.
    Terminated,
}

unsafe impl bytemuck::NoUninit for ThreadState {}

impl ThreadState {
    /// Cheap lock-free heuristic used before attempting to claim a target:
    /// only a thread whose published state is stable may be acted upon. The
    /// claim protocol re-checks this under the per-thread handshake lock.
    pub fn can_process_handshake(self) -> bool {
        matches!(self, ThreadState::Blocked | ThreadState::Terminated)
    }
}

static ID: AtomicU64 = AtomicU64::new(1);

/// A thread known to the runtime.
///
/// Every registered thread carries its own handshake state (the per-thread
/// operation queue plus claim lock) and a poll flag that is armed whenever an
/// operation is queued against it. Threads are expected to call
/// [`poll`](Thread::poll) at regular safe points and to park through
/// handshake-aware waits ([`blocked_scope`], the monitor's `*_with_handshake`
/// methods); a registered thread that does neither will stall any handshake
/// directed at it.
pub struct Thread {
    thread_id: u64,
    name: String,
    exec_status: Atomic<ThreadState>,
    poll_armed: AtomicBool,
    handshake: HandshakeState,
}

impl Thread {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            thread_id: ID.fetch_add(1, Ordering::SeqCst),
            name: name.into(),
            exec_status: Atomic::new(ThreadState::New),
            poll_armed: AtomicBool::new(false),
            handshake: HandshakeState::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.thread_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.exec_status.load(Ordering::SeqCst)
    }

    /// Set the execution status of the thread.
    ///
    /// # Safety
    ///
    /// This does not notify anyone of the transition. Callers must either be
    /// the thread itself at a safe point, or hold the thread's handshake
    /// lock (the terminated transition).
    pub(crate) unsafe fn set_exec_status(&self, status: ThreadState) {
        self.exec_status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn poll_armed(&self) -> bool {
        self.poll_armed.load(Ordering::SeqCst)
    }

    pub(crate) fn arm_poll(&self) {
        self.poll_armed.store(true, Ordering::SeqCst);
    }

    /// Only valid while holding the handshake state lock with no processable
    /// operations left; see `HandshakeState::maybe_disarm`.
    pub(crate) fn disarm_poll(&self) {
        self.poll_armed.store(false, Ordering::SeqCst);
    }

    pub(crate) fn handshake_state(&self) -> &HandshakeState {
        &self.handshake
    }

    /// The safepoint check. Call this at points where the thread's state is
    /// consistent enough for other threads to act on it; if any handshake
    /// operations are pending they are executed (and a pending suspension
    /// takes effect) before this returns.
    pub fn poll(&self) {
        debug_assert!(self.is_current());
        if self.poll_armed() {
            self.handshake.process_by_self(self, true);
        }
    }

    /// Publish that the current thread is about to park. While blocked, the
    /// thread must not mutate anything a handshake closure could observe.
    pub fn enter_blocked(&self) {
        debug_assert!(self.is_current());
        debug_assert_eq!(self.state(), ThreadState::Running);
        unsafe {
            self.set_exec_status(ThreadState::Blocked);
        }
    }

    /// Leave the blocked state. Anything that queued up while we were parked
    /// is processed before this returns, so an executor that claimed us while
    /// we were blocked is never raced by user code.
    pub fn leave_blocked(&self) {
        debug_assert!(self.is_current());
        unsafe {
            self.set_exec_status(ThreadState::Running);
        }
        fence(Ordering::SeqCst);
        if self.poll_armed() {
            self.handshake.process_by_self(self, true);
        }
    }

    fn is_current(&self) -> bool {
        try_current_thread().is_some_and(|t| t.thread_id == self.thread_id)
    }

    /// Start execution of `self` by creating and starting a native thread.
    /// The thread registers itself with `runtime` before running `f` and
    /// deregisters (completing any still-queued operations trivially) on the
    /// way out, even if `f` panics.
    pub fn start<F, R>(self: &Arc<Self>, runtime: &Arc<Runtime>, f: F) -> JoinHandle<Option<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        assert_eq!(self.state(), ThreadState::New, "thread already started");
        // Published before the spawn, so a handshake issued against a freshly
        // started thread already sees it out of `New`.
        unsafe {
            self.set_exec_status(ThreadState::Running);
        }
        let this = self.clone();
        let runtime = runtime.clone();
        std::thread::spawn(move || this.startoff(runtime, f))
    }

    fn startoff<F, R>(self: Arc<Self>, runtime: Arc<Runtime>, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
        R: Send + 'static,
    {
        init_current_thread(self.clone());
        debug_assert_eq!(self.state(), ThreadState::Running);
        runtime.registry().add_thread(self.clone());
        log::trace!("thread {} started", self.name);

        let result = std::panic::catch_unwind(AssertUnwindSafe(f));

        self.terminate(&runtime);
        deinit_current_thread();
        result.ok()
    }

    fn terminate(&self, runtime: &Runtime) {
        // Leave the registry first so broadcasts stop targeting us, then
        // flush the operation queue; requesters racing with the exit observe
        // trivial completion.
        runtime.registry().remove_thread(self.thread_id);
        self.handshake.thread_exit(self);
        log::trace!("thread {} terminated", self.name);
    }
}

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

pub fn current_thread() -> Arc<Thread> {
    try_current_thread().expect("no runtime thread is associated with the current OS thread")
}

pub fn try_current_thread() -> Option<Arc<Thread>> {
    CURRENT_THREAD.with(|t| t.borrow().clone())
}

fn init_current_thread(thread: Arc<Thread>) {
    CURRENT_THREAD.with(|t| *t.borrow_mut() = Some(thread));
}

fn deinit_current_thread() {
    CURRENT_THREAD.with(|t| *t.borrow_mut() = None);
}

/// Execute the given function with the current thread published as blocked.
///
/// While inside `f` the thread is at a safe point: handshake operations
/// against it may be executed by other threads, so `f` must not touch
/// anything a handshake closure could observe. Pending operations (including
/// a requested suspension) are processed on the way out.
pub fn blocked_scope<R>(f: impl FnOnce() -> R) -> R {
    let thread = current_thread();
    thread.enter_blocked();
    let result = f();
    thread.leave_blocked();
    result
}

/// The set of live runtime threads. Explicitly owned by a
/// [`Runtime`](crate::Runtime) rather than being process-global, so multiple
/// independent runtimes (and tests) can coexist.
pub struct ThreadRegistry {
    inner: Monitor<RefCell<Vec<Arc<Thread>>>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Monitor::new(RefCell::new(Vec::new())),
        }
    }

    pub(crate) fn add_thread(&self, thread: Arc<Thread>) {
        let inner = self.inner.lock_no_handshake();
        inner.borrow_mut().push(thread);
    }

    pub(crate) fn remove_thread(&self, thread_id: u64) {
        let inner = self.inner.lock_no_handshake();
        inner.borrow_mut().retain(|t| t.id() != thread_id);
    }

    /// Snapshot of the currently registered threads. Threads may terminate
    /// after the snapshot is taken; operations pushed to a terminated thread
    /// complete trivially.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        let inner = self.inner.lock_no_handshake();
        let threads = inner.borrow().clone();
        threads
    }
}
