//! Type-erased task frames and the continuation handoff protocol.
//!
//! A frame is a single heap allocation holding the erased header, the user
//! future and the result slot. `RawHandle` is a copyable pointer to the
//! header and is the only currency the scheduler and work queues deal in.

use std::{
    alloc::Layout,
    cell::{Cell, UnsafeCell},
    future::Future,
    marker::PhantomData,
    mem::ManuallyDrop,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

use crate::{event::EventRef, sched::SchedulerHandle, task::alloc::FrameAllocator, Priority};

/// No resumption arranged; a waker wake must schedule the frame itself.
const IDLE: u8 = 0;
/// The frame is being polled on some thread.
const POLLING: u8 = 1;
/// A wake arrived mid-poll; poll again before going idle.
const WOKEN: u8 = 2;
/// A resumption is already arranged (queued, awaiting or event-registered).
const PARKED: u8 = 3;

/// A transfer request recorded by a suspension awaitable during `poll` and
/// carried out by the trampoline after the poll has returned. Performing
/// the handoff only once the frame is quiescent is what makes it safe for
/// the handle to escape to another thread.
pub(crate) enum Transfer {
    Schedule {
        sched: SchedulerHandle,
        affinity: u64,
        priority: Priority,
    },
    AwaitTask {
        target: RawHandle,
    },
    AwaitEvent {
        sched: SchedulerHandle,
        event: EventRef,
        affinity: u64,
        priority: Priority,
    },
}

pub(crate) struct Header {
    step: unsafe fn(NonNull<Header>) -> Option<RawHandle>,
    destroy: unsafe fn(NonNull<Header>),
    state: AtomicU8,
    done: AtomicBool,
    /// The single-word rendezvous between awaiter and completer.
    flag: AtomicBool,
    /// Installed by the awaiter, read by the completer. Published through
    /// `flag`; never written twice.
    continuation: UnsafeCell<Option<RawHandle>>,
    /// Pending transfer request. Touched only by the thread currently
    /// polling the frame.
    transfer: UnsafeCell<Option<Transfer>>,
    /// Last scheduler this frame was routed through; used when an external
    /// waker wake has to re-enqueue the frame.
    sched: UnsafeCell<Option<SchedulerHandle>>,
    /// Single-slot join channel, present for joinable tasks only.
    join_tx: UnsafeCell<Option<flume::Sender<()>>>,
    /// Erased pointer to the frame's result slot.
    result_slot: Cell<*mut ()>,
}

#[repr(C)]
struct Frame<F: Future, A: FrameAllocator> {
    header: Header,
    future: UnsafeCell<ManuallyDrop<F>>,
    result: UnsafeCell<Option<F::Output>>,
    _alloc: PhantomData<A>,
}

/// Copyable, non-owning handle to a task frame. The analog of a coroutine
/// handle: cheap to pass around, and only valid while the owning task
/// handle keeps the frame alive.
#[derive(Clone, Copy)]
pub(crate) struct RawHandle(NonNull<Header>);

unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

impl RawHandle {
    /// Resume the frame, then keep resuming whatever handle each step
    /// returns. The loop is what turns a completer handing back its
    /// continuation into a symmetric transfer on the current thread.
    pub(crate) fn resume(self) {
        let mut next = Some(self);
        while let Some(handle) = next {
            next = unsafe { (handle.header().step)(handle.0) };
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.header().done.load(Ordering::Acquire)
    }

    pub(crate) fn defer(&self, transfer: Transfer) {
        unsafe {
            *self.header().transfer.get() = Some(transfer);
        }
    }

    /// Move the result out of a completed frame.
    ///
    /// Callers guarantee `T` is the output type the frame was allocated
    /// with and that the frame is complete.
    pub(crate) unsafe fn take_result<T>(&self) -> Option<T> {
        (*(self.header().result_slot.get() as *mut Option<T>)).take()
    }

    pub(crate) fn destroy(self) {
        unsafe { (self.header().destroy)(self.0) }
    }

    fn header(&self) -> &Header {
        unsafe { self.0.as_ref() }
    }

    /// Waker-driven wake. Re-polls a frame that is mid-poll, re-enqueues an
    /// idle one, and ignores frames whose resumption is already arranged.
    fn wake(self) {
        let header = self.header();
        if header.done.load(Ordering::Acquire) {
            return;
        }
        loop {
            match header.state.load(Ordering::Acquire) {
                POLLING => {
                    if header
                        .state
                        .compare_exchange(POLLING, WOKEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                IDLE => {
                    if header
                        .state
                        .compare_exchange(IDLE, PARKED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let sched = unsafe { (*header.sched.get()).clone() }
                            .unwrap_or_else(|| crate::Scheduler::instance().handle());
                        sched.schedule(self, 0, Priority::Low);
                        return;
                    }
                }
                // WOKEN or PARKED: a resumption is already pending
                _ => return,
            }
        }
    }
}

thread_local! {
    static CURRENT: Cell<Option<RawHandle>> = const { Cell::new(None) };
}

/// The frame being polled on this thread, if any. Suspension awaitables use
/// this to find the frame their transfer request belongs to.
pub(crate) fn current() -> Option<RawHandle> {
    CURRENT.with(|cell| cell.get())
}

struct CurrentGuard {
    prev: Option<RawHandle>,
}

impl CurrentGuard {
    fn enter(handle: RawHandle) -> Self {
        let prev = CURRENT.with(|cell| cell.replace(Some(handle)));
        Self { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        CURRENT.with(|cell| cell.set(prev));
    }
}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_waker, wake_waker, drop_waker);

unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
    RawWaker::new(ptr, &WAKER_VTABLE)
}

unsafe fn wake_waker(ptr: *const ()) {
    RawHandle(NonNull::new_unchecked(ptr as *mut Header)).wake();
}

unsafe fn drop_waker(_ptr: *const ()) {}

/// Allocate a frame for `future` through allocator `A` and hand back its
/// erased handle. Joinable frames carry the sender half of their join
/// channel; completion releases it exactly once.
pub(crate) fn allocate<F, A>(future: F, join_tx: Option<flume::Sender<()>>) -> RawHandle
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    A: FrameAllocator,
{
    let layout = Layout::new::<Frame<F, A>>();
    let ptr = A::alloc(layout).cast::<Frame<F, A>>();
    unsafe {
        ptr.as_ptr().write(Frame {
            header: Header {
                step: step::<F, A>,
                destroy: destroy::<F, A>,
                state: AtomicU8::new(PARKED),
                done: AtomicBool::new(false),
                flag: AtomicBool::new(false),
                continuation: UnsafeCell::new(None),
                transfer: UnsafeCell::new(None),
                sched: UnsafeCell::new(None),
                join_tx: UnsafeCell::new(join_tx),
                result_slot: Cell::new(std::ptr::null_mut()),
            },
            future: UnsafeCell::new(ManuallyDrop::new(future)),
            result: UnsafeCell::new(None),
            _alloc: PhantomData,
        });
        let raw = ptr.as_ptr();
        (*raw)
            .header
            .result_slot
            .set(std::ptr::addr_of_mut!((*raw).result) as *mut ());
    }
    RawHandle(ptr.cast())
}

/// Poll the frame until it suspends or completes, then carry out the
/// recorded transfer. Returns the next handle to resume, if the completed
/// frame handed over its continuation.
unsafe fn step<F, A>(ptr: NonNull<Header>) -> Option<RawHandle>
where
    F: Future,
    A: FrameAllocator,
{
    let frame = ptr.cast::<Frame<F, A>>();
    let header = ptr.as_ref();
    let handle = RawHandle(ptr);

    loop {
        header.state.store(POLLING, Ordering::Relaxed);

        let waker = ManuallyDrop::new(Waker::from_raw(RawWaker::new(
            ptr.as_ptr() as *const (),
            &WAKER_VTABLE,
        )));
        let mut cx = Context::from_waker(&waker);

        let polled = {
            let guard = CurrentGuard::enter(handle);
            let polled = panic::catch_unwind(AssertUnwindSafe(|| {
                Pin::new_unchecked(&mut **frame.as_ref().future.get()).poll(&mut cx)
            }));
            drop(guard);
            polled
        };

        let poll = match polled {
            Ok(poll) => poll,
            Err(_) => {
                // Abnormal task exits are unsupported; the result slot would
                // be left undefined for the awaiter.
                tracing::error!("task body panicked, aborting");
                std::process::abort();
            }
        };

        match poll {
            Poll::Ready(value) => {
                ManuallyDrop::drop(&mut *frame.as_ref().future.get());
                *frame.as_ref().result.get() = Some(value);
                header.done.store(true, Ordering::Release);

                if let Some(join_tx) = (*header.join_tx.get()).take() {
                    // Joinable tasks release the join channel and never
                    // resume a continuation.
                    let _ = join_tx.send(());
                    return None;
                }

                if header.flag.swap(true, Ordering::AcqRel) {
                    // The awaiter toggled first, so its continuation write
                    // is visible; hand it to the trampoline.
                    let continuation = (*header.continuation.get()).take();
                    if continuation.is_none() {
                        tracing::debug!("completed task has no continuation installed");
                    }
                    return continuation;
                }
                // No awaiter yet. The frame stays suspended at its final
                // point; the result persists until the awaiter reads it or
                // the owner drops the handle.
                return None;
            }
            Poll::Pending => match (*header.transfer.get()).take() {
                Some(Transfer::Schedule {
                    sched,
                    affinity,
                    priority,
                }) => {
                    *header.sched.get() = Some(sched.clone());
                    header.state.store(PARKED, Ordering::Release);
                    sched.schedule(handle, affinity, priority);
                    return None;
                }
                Some(Transfer::AwaitTask { target }) => {
                    header.state.store(PARKED, Ordering::Release);
                    *target.header().continuation.get() = Some(handle);
                    if target.header().flag.swap(true, Ordering::AcqRel) {
                        // The awaited task completed before our install was
                        // published; it will not read the continuation, so
                        // resume in place instead of suspending.
                        continue;
                    }
                    return None;
                }
                Some(Transfer::AwaitEvent {
                    sched,
                    event,
                    affinity,
                    priority,
                }) => {
                    *header.sched.get() = Some(sched.clone());
                    header.state.store(PARKED, Ordering::Release);
                    sched.schedule_on_event(handle, event, affinity, priority);
                    return None;
                }
                None => {
                    match header.state.compare_exchange(
                        POLLING,
                        IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return None,
                        // Woken mid-poll; poll again
                        Err(_) => continue,
                    }
                }
            },
        }
    }
}

unsafe fn destroy<F, A>(ptr: NonNull<Header>)
where
    F: Future,
    A: FrameAllocator,
{
    let frame = ptr.cast::<Frame<F, A>>();
    if !ptr.as_ref().done.load(Ordering::Acquire) {
        ManuallyDrop::drop(&mut *frame.as_ref().future.get());
    }
    std::ptr::drop_in_place(frame.as_ptr());
    A::free(ptr.cast(), Layout::new::<Frame<F, A>>());
}
