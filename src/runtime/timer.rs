//! Kernel timeouts as awaitable timers.

use super::op::{Op, Operation, Request};
use super::ring::Handle;
use super::time::{self, KernelTimespec};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

pub(crate) struct TimeoutOp {
    ts: KernelTimespec,
    absolute: bool,
}

impl Operation for TimeoutOp {
    type Output = io::Result<()>;

    fn into_request(self) -> Request {
        Request::Timeout {
            ts: Box::new(self.ts.into()),
            absolute: self.absolute,
        }
    }

    fn complete(_request: Request, result: io::Result<u32>) -> io::Result<()> {
        match result {
            Ok(_) => Ok(()),
            // Expiry is how a timeout normally completes.
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn orphaned(err: io::Error) -> io::Result<()> {
        Err(err)
    }
}

/// Creates timers bound to a ring.
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: &Handle) -> Self {
        Self {
            handle: handle.clone(),
        }
    }

    /// A timer that fires once `interval` has elapsed, counted from the
    /// first poll.
    pub fn create_timer(&self, interval: Duration) -> Timer {
        Timer {
            op: Op::new(
                &self.handle,
                TimeoutOp {
                    ts: time::to_timespec(interval),
                    absolute: false,
                },
            ),
        }
    }

    /// A timer that fires at `deadline`, measured on the monotonic clock.
    pub fn create_timer_at(&self, deadline: Instant) -> Timer {
        Timer {
            op: Op::new(
                &self.handle,
                TimeoutOp {
                    ts: time::deadline_to_timespec(deadline),
                    absolute: true,
                },
            ),
        }
    }
}

/// Future returned by [`Scheduler::create_timer`] and
/// [`Scheduler::create_timer_at`].
///
/// Resolves to `Ok(())` on expiry, or to the kernel error if the timeout was
/// cancelled. A timer is one-shot.
pub struct Timer {
    op: Op<TimeoutOp>,
}

impl Future for Timer {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.op).poll(cx)
    }
}
