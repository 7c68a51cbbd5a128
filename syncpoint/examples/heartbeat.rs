//! Small demo: a periodic heartbeat task on the service thread, a few
//! polling worker threads, and a broadcast handshake that greets each of
//! them at a safe point.
//!
//! Run with `RUST_LOG=info` (or `trace` to watch the handshake protocol).

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use clap::Parser;
use syncpoint::{
    handshake::{self, HandshakeClosure},
    service::{ServiceTask, TaskExecutionContext},
    threading::{blocked_scope, current_thread, Thread},
    Options, Runtime,
};

struct Heartbeat {
    beats: u64,
}

impl ServiceTask for Heartbeat {
    fn name(&self) -> &str {
        "Heartbeat"
    }

    fn execute(&mut self, ctx: &mut TaskExecutionContext) {
        self.beats += 1;
        log::info!("heartbeat {}", self.beats);
        ctx.reschedule(Duration::from_millis(250));
    }
}

struct Greet;

impl HandshakeClosure for Greet {
    fn name(&self) -> &str {
        "Greet"
    }

    fn do_thread(&self, thread: &Thread) {
        log::info!("hello from a safe point of {}", thread.name());
    }
}

fn main() {
    env_logger::init();
    let runtime = Runtime::new(Options::parse());

    runtime
        .service_thread()
        .register_task(Box::new(Heartbeat { beats: 0 }), Duration::ZERO);

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for i in 0..3 {
        let stop = stop.clone();
        let worker = Thread::new(format!("worker-{i}"));
        handles.push(worker.start(&runtime, move || {
            while !stop.load(Ordering::Relaxed) {
                current_thread().poll();
                blocked_scope(|| thread::sleep(Duration::from_millis(10)));
            }
        }));
    }

    thread::sleep(Duration::from_millis(600));
    handshake::execute_all(&runtime, Arc::new(Greet));

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
    runtime.shutdown();
}
