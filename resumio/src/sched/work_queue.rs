use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use core_affinity::CoreId;

use crate::{sched::SchedulerError, task::frame::RawHandle, Priority};

/// One work queue per CPU: two priority lanes, a ticket channel standing in
/// for the counting semaphore, and a worker thread pinned to the CPU index.
pub(crate) struct WorkQueue {
    shared: Arc<QueueShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Lane {
    tx: flume::Sender<RawHandle>,
    rx: flume::Receiver<RawHandle>,
}

struct QueueShared {
    id: u32,
    active: AtomicBool,
    /// Priority lanes, low to high.
    lanes: [Lane; Priority::COUNT],
    ticket_tx: flume::Sender<()>,
    ticket_rx: flume::Receiver<()>,
}

impl WorkQueue {
    pub(crate) fn start(id: u32) -> Result<Self, SchedulerError> {
        let (ticket_tx, ticket_rx) = flume::unbounded();
        let lanes = [(); Priority::COUNT].map(|_| {
            let (tx, rx) = flume::unbounded();
            Lane { tx, rx }
        });
        let shared = Arc::new(QueueShared {
            id,
            active: AtomicBool::new(true),
            lanes,
            ticket_tx,
            ticket_rx,
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("resumio-worker-{id}"))
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Approximate number of queued tasks across both lanes.
    pub(crate) fn size_approx(&self) -> usize {
        self.shared.lanes.iter().map(|lane| lane.rx.len()).sum()
    }

    pub(crate) fn enqueue(&self, handle: RawHandle, priority: Priority) {
        tracing::trace!("enqueueing task on cpu {}", self.shared.id);
        self.shared.lanes[priority as usize]
            .tx
            .send(handle)
            .inspect_err(|e| tracing::error!("enqueue on stopped work queue {e:}"))
            .ok();
        self.shared
            .ticket_tx
            .send(())
            .inspect_err(|e| tracing::error!("ticket release on stopped work queue {e:}"))
            .ok();
    }

    pub(crate) fn shutdown(&self) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.ticket_tx.send(()).ok();
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(thread) = guard.take() {
                let _ = thread.join();
            }
        }
    }
}

impl QueueShared {
    fn run(&self) {
        if !core_affinity::set_for_current(CoreId {
            id: self.id as usize,
        }) {
            tracing::debug!("failed to pin worker {} to its cpu", self.id);
        }

        while self.ticket_rx.recv().is_ok() {
            if !self.active.load(Ordering::Acquire) {
                return;
            }

            // One ticket per enqueued task, but the lanes are only
            // approximately consistent; rescan until the dequeue lands.
            'dequeue: loop {
                for lane in self.lanes.iter().rev() {
                    if let Ok(handle) = lane.rx.try_recv() {
                        tracing::trace!(
                            "dequeueing task on cpu {} thread {:?}",
                            self.id,
                            thread::current().id()
                        );
                        handle.resume();
                        break 'dequeue;
                    }
                }
            }
        }
    }
}
