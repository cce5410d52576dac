//! Benchmarks of suspension and continuation overhead

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use resumio::{spawn, spawn_joinable, Scheduler};

fn suspend_once(criterion: &mut Criterion) {
    // Spawn the thread pool up front so it is not measured.
    Scheduler::instance();

    criterion.bench_function("suspend_once", |b| {
        b.iter(|| {
            let task = spawn_joinable(async {
                resumio::suspend!();
            });
            black_box(task.join())
        })
    });
}

fn await_chain(criterion: &mut Criterion) {
    Scheduler::instance();

    criterion.bench_function("await_chain", |b| {
        b.iter(|| {
            let (tx, rx) = flume::bounded(1);
            let root = spawn_joinable(async move {
                let inner = spawn(async {
                    resumio::suspend!();
                    1
                });
                tx.send(inner.await).ok();
            });
            root.join();
            black_box(rx.recv().expect("chain result"))
        })
    });
}

fn fan_out(criterion: &mut Criterion) {
    Scheduler::instance();

    criterion.bench_function("fan_out_8", |b| {
        b.iter(|| {
            let (tx, rx) = flume::bounded(1);
            let root = spawn_joinable(async move {
                let tasks: Vec<_> = (0..8)
                    .map(|_| {
                        spawn(async {
                            resumio::suspend!();
                            1
                        })
                    })
                    .collect();
                let mut total = 0;
                for task in tasks {
                    total += task.await;
                }
                tx.send(total).ok();
            });
            root.join();
            black_box(rx.recv().expect("fan out result"))
        })
    });
}

criterion_group!(benches, suspend_once, await_chain, fan_out);
criterion_main!(benches);
