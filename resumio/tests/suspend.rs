use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use resumio::{spawn, spawn_joinable, Scheduler};

#[test]
fn suspend_migrates_thread() {
    let start = thread::current().id();
    let (tx, rx) = flume::bounded(1);

    let task = spawn_joinable(async move {
        resumio::suspend!();
        tx.send(thread::current().id()).ok();
    });
    task.join();

    let next = rx.recv().expect("task never reported its thread");
    assert_ne!(start, next);
}

#[test]
fn join_returns_only_after_the_body_finishes() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    let task = spawn_joinable(async move {
        resumio::suspend!();
        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::SeqCst);
    });
    task.join();

    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn fan_out_runs_in_parallel() {
    // The timing only demonstrates parallelism with at least 8 workers.
    let workers = Scheduler::instance().cpu_count();

    let (tx, rx) = flume::bounded(1);
    let root = spawn_joinable(async move {
        const COUNT: usize = 8;
        let tasks: Vec<_> = (0..COUNT)
            .map(|_| {
                spawn(async {
                    resumio::suspend!();
                    thread::sleep(Duration::from_millis(50));
                })
            })
            .collect();

        let started = Instant::now();
        for task in tasks {
            task.await;
        }
        tx.send(started.elapsed()).ok();
    });
    root.join();

    let elapsed = rx.recv().expect("root never reported its timing");
    if workers >= 8 {
        assert!(
            elapsed < Duration::from_millis(150),
            "8 sleeping tasks took {elapsed:?}"
        );
    }
}
