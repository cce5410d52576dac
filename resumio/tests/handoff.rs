//! Stress the race between a completing task and its awaiter installing a
//! continuation: over many trials with jittered timing, the continuation
//! must run exactly once and observe the final result.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use resumio::{spawn, spawn_joinable};

#[test]
fn continuation_runs_exactly_once_under_race() {
    const TRIALS: usize = 10_000;
    let resumed = Arc::new(AtomicUsize::new(0));

    for trial in 0..TRIALS {
        let resumed = Arc::clone(&resumed);

        let producer = spawn(async move {
            resumio::suspend!();
            trial
        });

        // Jitter the awaiter's arrival relative to the producer finishing.
        for _ in 0..(trial % 17) {
            std::hint::spin_loop();
        }

        let (tx, rx) = flume::bounded(1);
        let resumed_inner = Arc::clone(&resumed);
        let root = spawn_joinable(async move {
            let value = producer.await;
            resumed_inner.fetch_add(1, Ordering::SeqCst);
            tx.send(value).ok();
        });
        root.join();

        assert_eq!(rx.recv().expect("continuation never ran"), trial);
        assert_eq!(resumed.load(Ordering::SeqCst), trial + 1);
    }
}
