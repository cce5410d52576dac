mod work_queue;

use std::{
    num::NonZero,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, LazyLock, Mutex,
    },
    thread::{self, JoinHandle},
};

use arc_swap::ArcSwap;

use crate::{
    event::{Event, EventError, EventRef, WaitStatus},
    sched::work_queue::WorkQueue,
    task::frame::RawHandle,
    Priority,
};

/// The affinity mask is a single 64-bit word, so the scheduler runs at most
/// 64 workers even on wider machines.
const MAX_CPUS: usize = 64;

/// Golden ratio conjugate, driving the Kronecker sequence used to spread
/// load once every allowed queue is busy.
const PHI_CONJUGATE: f32 = 0.618_034;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("worker thread spawn failed {0}")]
    Thread(#[from] std::io::Error),
    #[error("event setup failed {0}")]
    Event(#[from] EventError),
}

/// A registration produced by an event await: the frame to resume and the
/// routing to apply once the event fires.
struct EventWaiter {
    handle: RawHandle,
    event: EventRef,
    affinity: u64,
    priority: Priority,
}

struct Shared {
    /// One queue per CPU, index i pinned to CPU i.
    queues: Box<[WorkQueue]>,
    /// Rotation counter for the low-discrepancy queue selection.
    update: AtomicU32,
    cpu_mask: u64,
    active: AtomicBool,
    /// Wake handle occupying slot 0 of the event thread's wait set.
    wake: Event,
    pending_tx: flume::Sender<EventWaiter>,
    pending_rx: flume::Receiver<EventWaiter>,
}

/// Routes suspended tasks onto per-CPU work queues and bridges OS event
/// waits back into task resumptions.
///
/// Construction spawns one pinned worker thread per CPU (capped at 64) and
/// the event multiplexer thread; dropping the scheduler joins them all. The
/// process-wide default lives behind [`Scheduler::instance`] and is never
/// dropped.
pub struct Scheduler {
    shared: Arc<Shared>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap cloneable handle used by suspension awaitables and the event
/// bridge to reach the scheduler's routing without holding the owner.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub(crate) fn schedule(&self, handle: RawHandle, affinity: u64, priority: Priority) {
        self.shared.schedule(handle, affinity, priority);
    }

    pub(crate) fn schedule_on_event(
        &self,
        handle: RawHandle,
        event: EventRef,
        affinity: u64,
        priority: Priority,
    ) {
        self.shared.schedule_on_event(handle, event, affinity, priority);
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle").finish()
    }
}

static INSTANCE: LazyLock<ArcSwap<Scheduler>> = LazyLock::new(|| {
    ArcSwap::from_pointee(Scheduler::new().expect("failed to start the default scheduler"))
});

impl Scheduler {
    /// Start a scheduler: one pinned worker per CPU plus the event thread.
    pub fn new() -> Result<Self, SchedulerError> {
        let cpu_count = thread::available_parallelism()
            .map(NonZero::get)
            .unwrap_or(1)
            .min(MAX_CPUS);
        let cpu_mask = if cpu_count == MAX_CPUS {
            u64::MAX
        } else {
            (1u64 << cpu_count) - 1
        };
        tracing::debug!("spawning scheduler with {cpu_count} worker threads");

        let queues = (0..cpu_count)
            .map(|id| WorkQueue::start(id as u32))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();

        let wake = Event::with_label(false, "resumio_wake")?;
        let (pending_tx, pending_rx) = flume::unbounded();

        let shared = Arc::new(Shared {
            queues,
            update: AtomicU32::new(rand::random()),
            cpu_mask,
            active: AtomicBool::new(true),
            wake,
            pending_tx,
            pending_rx,
        });

        let event_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("resumio-event-thread".to_string())
                .spawn(move || event_loop(shared))?
        };

        Ok(Self {
            shared,
            event_thread: Mutex::new(Some(event_thread)),
        })
    }

    /// The process-wide default scheduler, started lazily on first use.
    pub fn instance() -> Arc<Scheduler> {
        INSTANCE.load_full()
    }

    /// Replace the process-wide default. Tasks already routed through the
    /// previous default keep running on it for as long as they hold its
    /// handle.
    pub fn install(scheduler: Scheduler) {
        INSTANCE.store(Arc::new(scheduler));
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of work queues (and worker threads) this scheduler runs.
    pub fn cpu_count(&self) -> u32 {
        self.shared.queues.len() as u32
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cpu_count", &self.cpu_count())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.wake.signal().ok();
        if let Ok(mut guard) = self.event_thread.lock() {
            if let Some(thread) = guard.take() {
                let _ = thread.join();
            }
        }
        for queue in self.shared.queues.iter() {
            queue.shutdown();
        }
    }
}

impl Shared {
    /// Enqueue policy: canonicalize the affinity mask, prefer the first
    /// idle allowed queue, and otherwise spread with a Kronecker sequence.
    fn schedule(&self, handle: RawHandle, affinity: u64, priority: Priority) {
        // Bit i set means CPU i is allowed; zero means any CPU.
        let mut mask = if affinity == 0 {
            self.cpu_mask
        } else {
            affinity & self.cpu_mask
        };
        if mask == 0 {
            tracing::error!("affinity {affinity:#x} selects no online cpu, widening to all");
            mask = self.cpu_mask;
        }

        for (i, queue) in self.queues.iter().enumerate() {
            if mask & (1u64 << i) != 0 && queue.size_approx() == 0 {
                tracing::trace!("empty work queue {i} identified");
                queue.enqueue(handle, priority);
                return;
            }
        }

        // Every allowed queue appears busy; pick one with reasonably low
        // discrepancy (Kronecker recurrence on the golden ratio conjugate).
        let n = self.update.fetch_add(1, Ordering::Relaxed);
        let allowed = mask.count_ones();
        let point = (n as f32 * PHI_CONJUGATE).fract();
        let index = ((point * allowed as f32) as u32) % allowed;
        let queue = nth_set_bit(mask, index);
        tracing::trace!("work queue {queue} identified");
        self.queues[queue as usize].enqueue(handle, priority);
    }

    /// Hand a frame to the event thread: push the registration and signal
    /// the wake slot so the wait set is rebuilt.
    fn schedule_on_event(
        &self,
        handle: RawHandle,
        event: EventRef,
        affinity: u64,
        priority: Priority,
    ) {
        self.pending_tx
            .send(EventWaiter {
                handle,
                event,
                affinity,
                priority,
            })
            .inspect_err(|e| tracing::error!("event registration after shutdown {e:}"))
            .ok();
        self.wake
            .signal()
            .inspect_err(|e| tracing::error!("wake signal failure {e:}"))
            .ok();
    }
}

/// Index of the n-th set bit of `mask` (n < mask.count_ones()).
fn nth_set_bit(mask: u64, n: u32) -> u32 {
    let mut mask = mask;
    for _ in 0..n {
        mask &= mask - 1;
    }
    mask.trailing_zeros()
}

/// Body of the dedicated event thread: multiplex every registered wait
/// handle plus the wake slot, rescheduling continuations as their events
/// fire and growing the wait set as registrations arrive.
fn event_loop(shared: Arc<Shared>) {
    // Slot 0 is the wake handle and never moves.
    let mut events: Vec<EventRef> = vec![shared.wake.event_ref()];
    let mut waiters: Vec<EventWaiter> = Vec::new();

    loop {
        let result = EventRef::wait_many(&events);
        match result.status {
            WaitStatus::Failed => {
                tracing::error!("event wait failed, a registered handle may be dead");
                continue;
            }
            WaitStatus::Timeout => continue,
            WaitStatus::Normal | WaitStatus::Abandoned => {}
        }

        let index = result.index as usize;
        if index == 0 {
            if !shared.active.load(Ordering::Acquire) {
                return;
            }

            // Registrations are pending; drain the channel in bulk. The
            // channel may hand over more than first advertised.
            let pending = shared.pending_rx.len();
            events.reserve(pending * 2);
            waiters.reserve(pending * 2);
            let mut added = 0usize;
            while let Ok(waiter) = shared.pending_rx.try_recv() {
                events.push(waiter.event);
                waiters.push(waiter);
                added += 1;
            }
            tracing::trace!("added {added} events to the wait set");
        } else {
            tracing::trace!("event {index} signaled on the event thread");

            // Compact both arrays by swapping the fired entry with the last
            // live one; the wake slot is untouched.
            events.swap_remove(index);
            let waiter = waiters.swap_remove(index - 1);
            shared.schedule(waiter.handle, waiter.affinity, waiter.priority);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nth_set_bit_walks_the_mask() {
        assert_eq!(nth_set_bit(0b1, 0), 0);
        assert_eq!(nth_set_bit(0b1010, 0), 1);
        assert_eq!(nth_set_bit(0b1010, 1), 3);
        assert_eq!(nth_set_bit(0xf0, 2), 6);
        assert_eq!(nth_set_bit(1u64 << 63, 0), 63);
    }

    #[test]
    fn priority_clamps_to_two_levels() {
        assert_eq!(Priority::from_raw(0), Priority::Low);
        assert_eq!(Priority::from_raw(1), Priority::High);
        assert_eq!(Priority::from_raw(7), Priority::High);
    }
}
