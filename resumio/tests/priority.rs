//! Ordering properties of a single work queue. Everything here pins to
//! CPU 0, so the checks live in one test body to keep the queue to
//! themselves.

use std::{thread, time::Duration};

use resumio::{spawn_joinable, Scheduler};

#[test]
fn queue_order_respects_priority_then_fifo() {
    let (tx, rx) = flume::unbounded();

    // Occupy worker 0 so the later enqueues pile up behind it.
    let blocker_tx = tx.clone();
    let blocker = spawn_joinable(async move {
        resumio::suspend!(&Scheduler::instance(), 0x1, 1);
        thread::sleep(Duration::from_millis(50));
        blocker_tx.send("blocker").ok();
    });

    let low_tx = tx.clone();
    let low = spawn_joinable(async move {
        resumio::suspend!(&Scheduler::instance(), 0x1, 0);
        low_tx.send("low").ok();
    });

    let high_tx = tx.clone();
    let high = spawn_joinable(async move {
        resumio::suspend!(&Scheduler::instance(), 0x1, 1);
        high_tx.send("high").ok();
    });

    blocker.join();
    low.join();
    high.join();

    let order: Vec<&str> = rx.try_iter().collect();
    let high_at = order.iter().position(|&tag| tag == "high").expect("high ran");
    let low_at = order.iter().position(|&tag| tag == "low").expect("low ran");
    assert!(high_at < low_at, "high priority ran after low: {order:?}");

    // Within a single priority class the queue is strictly FIFO.
    let (tx, rx) = flume::unbounded();
    let tasks: Vec<_> = (0..6)
        .map(|index| {
            let tx = tx.clone();
            spawn_joinable(async move {
                resumio::suspend!(&Scheduler::instance(), 0x1, 0);
                tx.send(index).ok();
            })
        })
        .collect();
    for task in tasks {
        task.join();
    }

    let order: Vec<usize> = rx.try_iter().collect();
    assert_eq!(order, (0..6).collect::<Vec<_>>());
}
