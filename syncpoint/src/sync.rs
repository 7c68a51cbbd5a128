//! Synchronization primitives for the runtime.
//!
//! Provides primitives which are friendly to our thread system. The monitor
//! offers both `*_with_handshake` and `*_no_handshake` waits. The main
//! difference is that the former publishes the blocked state to the thread
//! system, so pending handshake operations can be executed on the waiter's
//! behalf while it sleeps; the latter blocks without letting anyone know.
//! Code that may park for a long time should prefer the `*_with_handshake`
//! methods so that handshakes (and anything built on them) do not stall.

pub mod filter_queue;
pub mod monitor;

pub use filter_queue::FilterQueue;
pub use monitor::*;

pub use super::threading::blocked_scope;
