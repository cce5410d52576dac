pub mod alloc;
pub(crate) mod frame;

use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    task::alloc::{DefaultAllocator, FrameAllocator},
    task::frame::{RawHandle, Transfer},
    Priority, Scheduler, SchedulerHandle,
};

/// An awaitable task: a suspendable computation producing a `T`.
///
/// Construction starts the body eagerly on the calling thread, up to its
/// first suspension point. Awaiting the task delivers the result by move;
/// a `Task` that is never awaited simply drops its result with the handle.
///
/// The handle exclusively owns the task frame. Dropping a task that is
/// still queued on a scheduler is a programming error, as it is for a raw
/// coroutine handle.
pub struct Task<T> {
    raw: RawHandle,
    _result: PhantomData<T>,
}

unsafe impl<T: Send> Send for Task<T> {}
unsafe impl<T: Send> Sync for Task<T> {}
impl<T> Unpin for Task<T> {}

impl<T> Task<T> {
    /// Whether the task body has run to completion.
    pub fn is_complete(&self) -> bool {
        self.raw.is_complete()
    }
}

impl<T: Send + 'static> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if this.raw.is_complete() {
            let value = unsafe { this.raw.take_result::<T>() }
                .expect("task result already consumed");
            return Poll::Ready(value);
        }
        let Some(current) = frame::current() else {
            panic!("tasks may only be awaited from within another resumio task");
        };
        current.defer(Transfer::AwaitTask { target: this.raw });
        Poll::Pending
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.raw.destroy();
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// A joinable root task, waited on with a blocking [`join`](JoinTask::join)
/// instead of an `await`.
///
/// Joinable tasks are never awaited (they do not implement [`Future`]) and
/// expose no result access; completion releases the join channel and
/// nothing else. `join` consumes the handle, so joining twice is rejected
/// at compile time.
pub struct JoinTask<T> {
    raw: RawHandle,
    join_rx: flume::Receiver<()>,
    _result: PhantomData<T>,
}

unsafe impl<T: Send> Send for JoinTask<T> {}

impl<T> JoinTask<T> {
    /// Block until the task body has run to its final point.
    pub fn join(self) {
        if let Err(e) = self.join_rx.recv() {
            tracing::error!("join channel closed without release {e:}");
        }
    }

    /// Whether the task body has run to completion.
    pub fn is_complete(&self) -> bool {
        self.raw.is_complete()
    }
}

impl<T> Drop for JoinTask<T> {
    fn drop(&mut self) {
        self.raw.destroy();
    }
}

impl<T> std::fmt::Debug for JoinTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinTask")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Create an awaitable task from `future`, running it eagerly on the
/// current thread up to its first suspension.
pub fn spawn<F>(future: F) -> Task<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_with::<DefaultAllocator, F>(future)
}

/// [`spawn`] with an explicit frame allocator.
pub fn spawn_with<A, F>(future: F) -> Task<F::Output>
where
    A: FrameAllocator,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let raw = frame::allocate::<F, A>(future, None);
    raw.resume();
    Task {
        raw,
        _result: PhantomData,
    }
}

/// Create a joinable root task from `future`, running it eagerly on the
/// current thread up to its first suspension.
pub fn spawn_joinable<F>(future: F) -> JoinTask<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_joinable_with::<DefaultAllocator, F>(future)
}

/// [`spawn_joinable`] with an explicit frame allocator.
pub fn spawn_joinable_with<A, F>(future: F) -> JoinTask<F::Output>
where
    A: FrameAllocator,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (join_tx, join_rx) = flume::bounded(1);
    let raw = frame::allocate::<F, A>(future, Some(join_tx));
    raw.resume();
    JoinTask {
        raw,
        join_rx,
        _result: PhantomData,
    }
}

/// Awaitable returned by [`suspend`]. The first poll hands the task to the
/// scheduler; the task resumes on whichever worker the routing policy
/// picks, never inline.
pub struct Suspend {
    sched: SchedulerHandle,
    affinity: u64,
    priority: Priority,
    yielded: bool,
}

impl Unpin for Suspend {}

impl Future for Suspend {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        let Some(current) = frame::current() else {
            panic!("suspend may only be awaited from within a resumio task");
        };
        this.yielded = true;
        current.defer(Transfer::Schedule {
            sched: this.sched.clone(),
            affinity: this.affinity,
            priority: this.priority,
        });
        Poll::Pending
    }
}

/// Suspend the current task and re-enqueue it on `scheduler`, restricted to
/// the CPUs set in `affinity` (zero means any) at the given priority.
/// Remember to `.await` the returned value; the [`suspend!`](crate::suspend!)
/// macro family covers the common forms.
pub fn suspend(scheduler: &Scheduler, affinity: u64, priority: Priority) -> Suspend {
    Suspend {
        sched: scheduler.handle(),
        affinity,
        priority,
        yielded: false,
    }
}
