use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use syncpoint::{
    service::{ServiceTask, TaskExecutionContext},
    Options, Runtime,
};

fn runtime() -> Arc<Runtime> {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(Options::default())
}

struct CountingTask {
    count: Arc<AtomicUsize>,
    reschedule_every: Option<Duration>,
}

impl ServiceTask for CountingTask {
    fn name(&self) -> &str {
        "Counting"
    }

    fn execute(&mut self, ctx: &mut TaskExecutionContext) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Some(period) = self.reschedule_every {
            ctx.reschedule(period);
        }
    }
}

#[test]
fn immediate_task_runs_promptly() {
    let rt = runtime();
    let count = Arc::new(AtomicUsize::new(0));
    rt.service_thread().register_task(
        Box::new(CountingTask {
            count: count.clone(),
            reschedule_every: None,
        }),
        Duration::ZERO,
    );

    let deadline = Instant::now() + Duration::from_secs(2);
    while count.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "immediate task never ran");
        thread::sleep(Duration::from_millis(1));
    }
    // One-shot: it must not run again.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::Relaxed), 1);
    rt.shutdown();
}

#[test]
fn task_without_reschedule_runs_once() {
    let rt = runtime();
    let count = Arc::new(AtomicUsize::new(0));
    rt.service_thread().register_task(
        Box::new(CountingTask {
            count: count.clone(),
            reschedule_every: None,
        }),
        Duration::from_millis(10),
    );
    thread::sleep(Duration::from_millis(500));
    assert_eq!(count.load(Ordering::Relaxed), 1);
    rt.shutdown();
}

#[test]
fn periodic_task_keeps_running_until_shutdown() {
    let rt = runtime();
    let count = Arc::new(AtomicUsize::new(0));
    rt.service_thread().register_task(
        Box::new(CountingTask {
            count: count.clone(),
            reschedule_every: Some(Duration::from_millis(20)),
        }),
        Duration::ZERO,
    );

    thread::sleep(Duration::from_millis(300));
    // Loose lower bound: scheduling jitter must not fail the test, but the
    // task clearly has to have rescheduled itself a few times.
    assert!(count.load(Ordering::Relaxed) >= 3);

    rt.shutdown();
    let at_shutdown = count.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::Relaxed), at_shutdown);
}

#[test]
fn earlier_due_time_runs_first() {
    struct OrderedTask {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ServiceTask for OrderedTask {
        fn name(&self) -> &str {
            self.tag
        }

        fn execute(&mut self, _ctx: &mut TaskExecutionContext) {
            self.order.lock().unwrap().push(self.tag);
        }
    }

    let rt = runtime();
    let order = Arc::new(Mutex::new(Vec::new()));
    // Registered in the "wrong" order on purpose.
    rt.service_thread().register_task(
        Box::new(OrderedTask {
            tag: "late",
            order: order.clone(),
        }),
        Duration::from_millis(60),
    );
    rt.service_thread().register_task(
        Box::new(OrderedTask {
            tag: "early",
            order: order.clone(),
        }),
        Duration::from_millis(10),
    );

    thread::sleep(Duration::from_millis(300));
    assert_eq!(*order.lock().unwrap(), ["early", "late"]);
    rt.shutdown();
}

#[test]
fn registration_after_shutdown_is_dropped() {
    let rt = runtime();
    rt.shutdown();

    let count = Arc::new(AtomicUsize::new(0));
    rt.service_thread().register_task(
        Box::new(CountingTask {
            count: count.clone(),
            reschedule_every: None,
        }),
        Duration::ZERO,
    );
    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::Relaxed), 0);
}
