use resumio::{spawn, spawn_joinable, Scheduler, Task};

fn chain1() -> Task<i32> {
    spawn(async {
        resumio::suspend!();
        1
    })
}

fn chain2() -> Task<i32> {
    spawn(async { chain1().await })
}

#[test]
fn chained_continuation_delivers_the_result() {
    let use_affinity = Scheduler::instance().cpu_count() > 4;
    let mask = if use_affinity { 1u64 << 4 } else { 0 };
    let (tx, rx) = flume::bounded(1);

    let root = spawn_joinable(async move {
        resumio::suspend!(&Scheduler::instance(), mask);
        let name = thread_name();
        let value = chain2().await;
        tx.send((name, value)).ok();
    });
    root.join();

    let (name, value) = rx.recv().expect("root never reported");
    assert_eq!(value, 1);
    if use_affinity {
        // bit 4 set means the root may only resume on CPU 4's worker
        assert_eq!(name.as_deref(), Some("resumio-worker-4"));
    }
}

#[test]
fn awaiting_a_completed_task_reads_without_suspending() {
    let ready = spawn(async { 7 });
    assert!(ready.is_complete());

    let (tx, rx) = flume::bounded(1);
    let root = spawn_joinable(async move {
        tx.send(ready.await).ok();
    });
    root.join();

    assert_eq!(rx.recv().expect("root never reported"), 7);
}

fn thread_name() -> Option<String> {
    std::thread::current().name().map(str::to_owned)
}
