//! Safepoint-synchronized cross-thread task execution.
//!
//! Two cooperating pieces:
//!
//! - [`handshake`]: let one thread force another running thread to execute a
//!   closure at a guaranteed-safe point, without a global stop-the-world
//!   pause. Built on a per-thread lock-free operation queue with a
//!   try-lock claim protocol, plus a spin-then-block wait strategy.
//! - [`service`]: a background service thread draining a time-ordered task
//!   queue; tasks may reschedule themselves.
//!
//! Everything hangs off an explicitly constructed [`Runtime`] (the thread
//! registry, the options, the service thread), so independent instances can
//! coexist in one process and in tests.

use std::sync::{Arc, OnceLock};

pub mod handshake;
pub mod options;
pub mod service;
pub mod sync;
pub mod threading;

pub use options::Options;

use service::ServiceThread;
use threading::ThreadRegistry;

/// The registry object tying the subsystem together: the set of live
/// threads, the tuning options, and the single background service thread.
pub struct Runtime {
    registry: ThreadRegistry,
    options: Options,
    service: OnceLock<ServiceThread>,
}

impl Runtime {
    pub fn new(options: Options) -> Arc<Self> {
        let runtime = Arc::new(Self {
            registry: ThreadRegistry::new(),
            options,
            service: OnceLock::new(),
        });
        let service = ServiceThread::start(&runtime);
        let _ = runtime.service.set(service);
        runtime
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn service_thread(&self) -> &ServiceThread {
        self.service.get().expect("service thread not started")
    }

    /// Stop the service thread and wait for it to exit. Threads spawned
    /// against this runtime are not owned by it and keep running.
    pub fn shutdown(&self) {
        self.service_thread().stop();
    }
}
