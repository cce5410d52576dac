use tracing_subscriber::{EnvFilter, FmtSubscriber};

use resumio::{spawn, spawn_joinable, Event, Scheduler};

fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting subscriber failed");

    println!(
        "running on {} worker threads",
        Scheduler::instance().cpu_count()
    );

    let event = Event::new(false).expect("event creation failed");
    let fired = event.event_ref();

    let waiter = spawn_joinable(async move {
        println!("waiter parked on the event");
        fired.await;
        println!(
            "waiter resumed on {:?}",
            std::thread::current().name()
        );
    });

    let signaler = spawn_joinable(async move {
        resumio::suspend!();
        std::thread::sleep(std::time::Duration::from_millis(50));
        println!("signaling from {:?}", std::thread::current().name());
        event.signal().expect("signal failed");
    });

    signaler.join();
    waiter.join();

    let root = spawn_joinable(async {
        let doubled = spawn(async {
            resumio::suspend!();
            21 * 2
        });
        println!("the answer is {}", doubled.await);
    });
    root.join();
}
