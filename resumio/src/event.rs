//! OS event objects bridged to task resumption.
//!
//! Events wrap an eventfd. Signaling writes to the counter, waiting polls
//! the descriptor for readability, and auto-reset events drain the counter
//! when a wait observes them signaled, which reproduces the auto-reset
//! behavior of the classic many-wait primitives this contract descends
//! from. Manual-reset events stay signaled until [`EventRef::reset`].

use std::{
    future::{Future, IntoFuture},
    io,
    ops::Deref,
    os::fd::RawFd,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    task::frame::{self, Transfer},
    Priority, Scheduler,
};

#[derive(thiserror::Error, Debug)]
pub enum EventError {
    #[error("eventfd creation failed {0}")]
    Create(#[source] io::Error),
    #[error("event signal failed {0}")]
    Signal(#[source] io::Error),
}

/// Outcome class of a many-wait, in the idiom of the platform primitives
/// this bridges: abandoned is dispatched like normal, timeout and failed
/// leave the wait set untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Normal,
    Abandoned,
    Timeout,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct WaitResult {
    pub status: WaitStatus,
    /// Index of the signaled handle when `status` dispatches.
    pub index: u32,
}

/// Non-owning, copyable view of an event's wait handle.
#[derive(Debug, Clone, Copy)]
pub struct EventRef {
    fd: RawFd,
    manual_reset: bool,
}

impl EventRef {
    /// Check whether the event is signaled, without consuming the signal.
    pub fn is_signaled(&self) -> bool {
        let mut fds = [libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        ret > 0 && fds[0].revents & libc::POLLIN != 0
    }

    /// Block until the event is signaled. Consumes the signal for
    /// auto-reset events. Returns false if the wait failed.
    pub fn wait(&self) -> bool {
        loop {
            let mut fds = [libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            }];
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, -1) };
            if ret < 0 {
                if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return false;
            }
            if fds[0].revents & libc::POLLIN != 0 {
                if !self.manual_reset {
                    drain(self.fd);
                }
                return true;
            }
            if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return false;
            }
        }
    }

    /// Mark the event signaled.
    pub fn signal(&self) -> Result<(), EventError> {
        let value: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return Err(EventError::Signal(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Mark the event unsignaled. Only needed for manual-reset events;
    /// auto-reset events clear as they are waited on.
    pub fn reset(&self) {
        drain(self.fd);
    }

    /// Wait until any handle in `events` is signaled and report which.
    /// Auto-reset entries are consumed on the way out.
    pub fn wait_many(events: &[EventRef]) -> WaitResult {
        let mut fds: Vec<libc::pollfd> = events
            .iter()
            .map(|event| libc::pollfd {
                fd: event.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            // An interrupted wait has nothing ready; report it like a
            // timeout so callers keep waiting.
            let status = if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                WaitStatus::Timeout
            } else {
                WaitStatus::Failed
            };
            return WaitResult { status, index: 0 };
        }
        if ret == 0 {
            return WaitResult {
                status: WaitStatus::Timeout,
                index: 0,
            };
        }

        for (i, fd) in fds.iter().enumerate() {
            if fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return WaitResult {
                    status: WaitStatus::Failed,
                    index: i as u32,
                };
            }
            if fd.revents & libc::POLLIN != 0 {
                if !events[i].manual_reset {
                    drain(events[i].fd);
                }
                return WaitResult {
                    status: WaitStatus::Normal,
                    index: i as u32,
                };
            }
        }

        WaitResult {
            status: WaitStatus::Timeout,
            index: 0,
        }
    }
}

/// Clear the eventfd counter. The descriptor is non-blocking, so a clear
/// counter reads as EAGAIN and is left alone.
fn drain(fd: RawFd) {
    let mut value = 0u64;
    unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
}

/// An owning event. The affinity and priority set here apply to the
/// continuation scheduled when an await on this event completes.
pub struct Event {
    inner: EventRef,
    affinity: u64,
    priority: Priority,
}

impl Event {
    /// Create an event. Auto-reset events clear as they are waited on;
    /// manual-reset events stay signaled until [`EventRef::reset`].
    pub fn new(manual_reset: bool) -> Result<Self, EventError> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(EventError::Create(io::Error::last_os_error()));
        }
        Ok(Self {
            inner: EventRef { fd, manual_reset },
            affinity: 0,
            priority: Priority::Low,
        })
    }

    /// [`Event::new`] with a label for tracing.
    pub fn with_label(manual_reset: bool, label: &str) -> Result<Self, EventError> {
        let event = Self::new(manual_reset)?;
        tracing::trace!("created event {label} on fd {}", event.inner.fd);
        Ok(event)
    }

    pub fn set_affinity(&mut self, affinity: u64) {
        self.affinity = affinity;
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Non-owning reference, e.g. for [`EventRef::wait_many`] or to move
    /// into a task that awaits this event.
    pub fn event_ref(&self) -> EventRef {
        self.inner
    }
}

impl Deref for Event {
    type Target = EventRef;

    fn deref(&self) -> &EventRef {
        &self.inner
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe { libc::close(self.inner.fd) };
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("fd", &self.inner.fd)
            .field("manual_reset", &self.inner.manual_reset)
            .finish()
    }
}

/// Awaitable produced by awaiting an [`Event`] or [`EventRef`] inside a
/// task. Completes immediately if the event is already signaled; otherwise
/// the task is registered with the default scheduler's event thread and
/// resumes once the event fires.
pub struct EventFuture {
    event: EventRef,
    affinity: u64,
    priority: Priority,
    registered: bool,
}

impl Unpin for EventFuture {}

impl Future for EventFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.registered || this.event.is_signaled() {
            return Poll::Ready(());
        }
        let Some(current) = frame::current() else {
            panic!("events may only be awaited from within a resumio task");
        };
        this.registered = true;
        current.defer(Transfer::AwaitEvent {
            sched: Scheduler::instance().handle(),
            event: this.event,
            affinity: this.affinity,
            priority: this.priority,
        });
        Poll::Pending
    }
}

impl IntoFuture for &Event {
    type Output = ();
    type IntoFuture = EventFuture;

    fn into_future(self) -> EventFuture {
        EventFuture {
            event: self.inner,
            affinity: self.affinity,
            priority: self.priority,
            registered: false,
        }
    }
}

impl IntoFuture for EventRef {
    type Output = ();
    type IntoFuture = EventFuture;

    fn into_future(self) -> EventFuture {
        EventFuture {
            event: self,
            affinity: 0,
            priority: Priority::Low,
            registered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_wait_returns_immediately() {
        let event = Event::new(false).expect("eventfd");
        assert!(!event.is_signaled());
        event.signal().expect("signal");
        assert!(event.is_signaled());
        assert!(event.wait());
        // auto-reset: the wait consumed the signal
        assert!(!event.is_signaled());
    }

    #[test]
    fn manual_reset_stays_signaled_until_reset() {
        let event = Event::new(true).expect("eventfd");
        event.signal().expect("signal");
        assert!(event.wait());
        assert!(event.is_signaled());
        event.reset();
        assert!(!event.is_signaled());
    }

    #[test]
    fn wait_many_reports_the_signaled_index() {
        let first = Event::new(false).expect("eventfd");
        let second = Event::new(false).expect("eventfd");
        second.signal().expect("signal");

        let result = EventRef::wait_many(&[first.event_ref(), second.event_ref()]);
        assert_eq!(result.status, WaitStatus::Normal);
        assert_eq!(result.index, 1);
    }
}
