use std::{
    thread,
    time::{Duration, Instant},
};

use resumio::{spawn_joinable, Event, Priority};

#[test]
fn event_bridge_resumes_a_waiting_task() {
    let event = Event::new(false).expect("eventfd");
    let waited = event.event_ref();

    let task = spawn_joinable(async move {
        waited.await;
    });

    // Give the registration a moment to reach the event thread, then fire.
    thread::sleep(Duration::from_millis(20));
    let started = Instant::now();
    event.signal().expect("signal");
    task.join();

    assert!(
        started.elapsed() < Duration::from_secs(1),
        "event resumption took {:?}",
        started.elapsed()
    );
}

#[test]
fn signaled_manual_reset_event_resumes_promptly() {
    let event = Event::new(true).expect("eventfd");
    let waited = event.event_ref();

    let task = spawn_joinable(async move {
        // Get off the spawning thread before awaiting, so the signal below
        // can race with (or precede) the registration.
        resumio::suspend!();
        waited.await;
    });
    event.signal().expect("signal");
    task.join();

    // Manual reset: the event is still signaled after dispatch.
    assert!(event.is_signaled());
}

#[test]
fn event_continuation_honors_affinity_and_priority() {
    let mut event = Event::new(false).expect("eventfd");
    event.set_affinity(0x1);
    event.set_priority(Priority::High);
    let signal = event.event_ref();

    let (tx, rx) = flume::bounded(1);
    let task = spawn_joinable(async move {
        (&event).await;
        tx.send(thread::current().name().map(str::to_owned)).ok();
    });

    thread::sleep(Duration::from_millis(20));
    signal.signal().expect("signal");
    task.join();

    let name = rx.recv().expect("task never reported");
    assert_eq!(name.as_deref(), Some("resumio-worker-0"));
}
