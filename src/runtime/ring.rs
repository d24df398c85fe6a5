//! The io_uring instance and the completion loop around it.
//!
//! Completion-based model: tasks queue submissions while they run, and the
//! ring flushes them to the kernel when it next waits. Completions are
//! drained in batches; each one is dispatched to its operation record, and
//! the task waiting on that record is resumed before the next completion
//! is looked at.

use super::op::{set_continuation, Completion, Dispatch, Handler, Record, Request, Response};
use super::task::{Executor, Task};
use super::time;
use super::token::TokenTable;
use crate::error::Error;
use io_uring::{types, IoUring};
use serde::Deserialize;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::task::{Poll, Waker};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// User data of the cancel-everything request issued on shutdown. It has no
/// record.
const SHUTDOWN_TOKEN: u64 = u64::MAX;

/// Ring setup parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Submission queue depth.
    pub sq_entries: u32,
    /// Completion queue depth. The kernel default (twice the submission
    /// queue depth) when unset.
    pub cq_entries: Option<u32>,
    /// Busy-poll for completions instead of taking interrupts.
    pub iopoll: bool,
    /// Have a kernel thread poll the submission queue.
    pub sqpoll: bool,
    /// Idle time in milliseconds before the polling thread sleeps.
    pub sqpoll_idle_ms: u32,
    /// CPU to pin the polling thread to.
    pub sqpoll_cpu: Option<u32>,
    /// Clamp oversized queue depths instead of failing setup.
    pub clamp: bool,
    /// Keep submitting a batch after one entry fails.
    pub submit_all: bool,
    /// Only run deferred task work when entering the kernel.
    pub coop_taskrun: bool,
    /// How long `run`, `run_until` and `block_on` wait per iteration.
    pub wait_interval_ms: u64,
    /// Upper bound on cancellation requests in flight at once.
    pub max_cancellations: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            sq_entries: 1024,
            cq_entries: None,
            iopoll: false,
            sqpoll: false,
            sqpoll_idle_ms: 1000,
            sqpoll_cpu: None,
            clamp: false,
            submit_all: false,
            coop_taskrun: false,
            wait_interval_ms: 1000,
            max_cancellations: 1024,
        }
    }
}

impl RingConfig {
    fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }
}

/// Kernel-facing half of the ring: the io_uring instance and every record
/// the kernel may still reference.
struct Core {
    uring: IoUring,
    tokens: TokenTable,
    /// Reused between drains so a batch doesn't allocate.
    scratch: Vec<(u64, Completion)>,
}

impl Core {
    fn dispatch(&mut self, token: u64, completion: Completion) -> Option<Waker> {
        if token == SHUTDOWN_TOKEN {
            return None;
        }
        let record = match self.tokens.get_mut(token) {
            Some(record) => record,
            None => {
                warn!(token, result = completion.result, "Unknown token in completion");
                return None;
            }
        };
        trace!(
            token,
            op = record.request.kind(),
            result = completion.result,
            flags = completion.flags,
            "Dispatching completion"
        );
        match record.complete(completion) {
            Dispatch::Keep(waker) => waker,
            Dispatch::Release => {
                self.tokens.free(token);
                None
            }
        }
    }
}

pub(crate) struct Shared {
    core: RefCell<Core>,
    executor: Executor,
    /// Fatal error raised where it could not be returned directly, such as a
    /// full submission queue hit from inside a task.
    fatal: RefCell<Option<Error>>,
    config: RingConfig,
}

/// Result of polling a multishot record.
pub(crate) enum StreamPoll {
    /// Next queued completion. `ended` means the record has been released
    /// and the request must be re-armed before waiting again.
    Item { completion: Completion, ended: bool },
    /// No completion left and the request is no longer armed. The record
    /// has been released.
    Ended,
    Pending,
}

impl Shared {
    fn set_fatal(&self, err: Error) {
        let mut fatal = self.fatal.borrow_mut();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    fn take_fatal(&self) -> Result<(), Error> {
        match self.fatal.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Register a record and queue its submission entry.
    ///
    /// On failure the request is handed back so its buffers can be returned
    /// to the caller.
    pub fn submit(
        &self,
        request: Request,
        handler: Handler,
        continuation: Option<Waker>,
    ) -> Result<u64, (Error, Request)> {
        let mut core = self.core.borrow_mut();
        let core = &mut *core;

        let (token, record) = core.tokens.alloc(Record::new(request, handler, continuation));
        let op = record.request.kind();
        let entry = record.request.build().user_data(token);

        // The entry points into the record, which stays in the table until
        // its final completion has been dispatched.
        let pushed = unsafe { core.uring.submission().push(&entry) };
        if pushed.is_err() {
            let entries = core.uring.params().sq_entries();
            warn!(token, op, entries, "Submission queue full");
            self.set_fatal(Error::SubmissionQueueFull(entries));
            return match core.tokens.free(token) {
                Some(record) => Err((Error::SubmissionQueueFull(entries), record.request)),
                None => unreachable!("record allocated above"),
            };
        }

        trace!(token, op, "Queued submission");
        Ok(token)
    }

    /// Take the completion of a single-shot record, or register `waker` to be
    /// woken when it arrives.
    pub fn poll_completion(&self, token: u64, waker: &Waker) -> Poll<Option<(Request, Completion)>> {
        let mut core = self.core.borrow_mut();
        let completion = match core.tokens.get_mut(token) {
            Some(record) => match record.response {
                Response::Ready(completion) => completion,
                _ => {
                    set_continuation(&mut record.continuation, waker);
                    return Poll::Pending;
                }
            },
            None => return Poll::Ready(None),
        };
        Poll::Ready(core.tokens.free(token).map(|record| (record.request, completion)))
    }

    /// Take the next completion of a multishot record.
    pub fn poll_stream(&self, token: u64, waker: &Waker) -> StreamPoll {
        let mut core = self.core.borrow_mut();
        let poll = match core.tokens.get_mut(token) {
            Some(record) => record.poll_stream(waker),
            None => return StreamPoll::Ended,
        };
        if matches!(poll, StreamPoll::Ended | StreamPoll::Item { ended: true, .. }) {
            core.tokens.free(token);
        }
        poll
    }

    /// Give up on a record. It is released now if its final completion has
    /// already arrived, otherwise when it does.
    pub fn abandon(&self, token: u64) {
        let mut core = self.core.borrow_mut();
        let release = match core.tokens.get_mut(token) {
            Some(record) => record.abandon(),
            None => false,
        };
        if release {
            core.tokens.free(token);
        }
    }

    /// Cancel every request in flight against `fd` and push the
    /// cancellation to the kernel right away.
    pub fn cancel_fd(&self, fd: RawFd) -> Result<(), Error> {
        {
            let core = self.core.borrow();
            if core.tokens.cancels() >= self.config.max_cancellations {
                warn!(
                    fd,
                    limit = self.config.max_cancellations,
                    "Too many cancellations in flight, skipping"
                );
                return Ok(());
            }
        }
        self.submit(Request::Cancel { fd }, Handler::Discard, None)
            .map_err(|(err, _)| err)?;
        debug!(fd, "Cancelling operations");
        self.flush()?;
        Ok(())
    }

    /// Hand every queued submission to the kernel without waiting.
    pub fn flush(&self) -> Result<usize, Error> {
        let core = self.core.borrow();
        core.uring.submit().map_err(Error::Submit)
    }

    /// Submit queued entries, then block until `min_count` completions are
    /// available or `timeout` passes.
    fn enter(&self, min_count: usize, timeout: Duration) -> Result<(), Error> {
        let core = self.core.borrow();
        let ts: types::Timespec = time::to_timespec(timeout).into();
        let args = types::SubmitArgs::new().timespec(&ts);
        match core.uring.submitter().submit_with_args(min_count, &args) {
            Ok(submitted) => {
                trace!(submitted, "Entered ring");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(()),
            Err(e) => Err(Error::Wait(e)),
        }
    }

    /// Dispatch every available completion, resuming waiting tasks as it
    /// goes. Returns how many completions were dispatched.
    fn drain(&self) -> usize {
        let mut batch = {
            let mut core = self.core.borrow_mut();
            let mut batch = mem::take(&mut core.scratch);
            // The completion queue head advances once, when the iterator
            // is dropped at the end of this statement.
            batch.extend(core.uring.completion().map(|cqe| {
                (
                    cqe.user_data(),
                    Completion {
                        result: cqe.result(),
                        flags: cqe.flags(),
                    },
                )
            }));
            batch
        };

        let count = batch.len();
        for (token, completion) in batch.drain(..) {
            let waker = self.core.borrow_mut().dispatch(token, completion);
            if let Some(waker) = waker {
                waker.wake();
            }
            self.executor.run_ready();
        }
        self.core.borrow_mut().scratch = batch;

        if count > 0 {
            trace!(count, "Drained completions");
        }
        count
    }

    /// Queue an entry that has no record. Returns false if the submission
    /// queue is full.
    fn push_raw(&self, entry: &io_uring::squeue::Entry) -> bool {
        let mut core = self.core.borrow_mut();
        // The entry carries no pointers.
        let pushed = unsafe { core.uring.submission().push(entry) }.is_ok();
        pushed
    }

    fn in_flight(&self) -> usize {
        self.core.borrow().tokens.len()
    }
}

/// A single-threaded io_uring event loop with a cooperative task executor.
///
/// The ring owns the kernel instance, every in-flight operation record and
/// every task. It is not `Send`; tasks, sockets and timers created from it
/// live on the same thread and reach it through a [`Handle`].
pub struct Ring {
    shared: Rc<Shared>,
}

/// Cheap, cloneable reference to a [`Ring`].
///
/// A handle does not keep the ring alive. Once the ring is dropped, every
/// operation started through a handle fails with [`Error::RingGone`].
#[derive(Clone)]
pub struct Handle {
    shared: Weak<Shared>,
}

impl Ring {
    /// Create a ring with the given parameters.
    pub fn new(config: &RingConfig) -> Result<Self, Error> {
        let mut builder = IoUring::builder();
        if let Some(cq_entries) = config.cq_entries {
            builder.setup_cqsize(cq_entries);
        }
        if config.iopoll {
            builder.setup_iopoll();
        }
        if config.sqpoll {
            builder.setup_sqpoll(config.sqpoll_idle_ms);
            if let Some(cpu) = config.sqpoll_cpu {
                builder.setup_sqpoll_cpu(cpu);
            }
        }
        if config.clamp {
            builder.setup_clamp();
        }
        if config.submit_all {
            builder.setup_submit_all();
        }
        if config.coop_taskrun {
            builder.setup_coop_taskrun();
        }
        let uring = builder.build(config.sq_entries).map_err(Error::Setup)?;

        info!(
            sq_entries = uring.params().sq_entries(),
            cq_entries = uring.params().cq_entries(),
            sqpoll = config.sqpoll,
            iopoll = config.iopoll,
            "Ring created"
        );

        Ok(Self {
            shared: Rc::new(Shared {
                core: RefCell::new(Core {
                    uring,
                    tokens: TokenTable::new(config.sq_entries as usize),
                    scratch: Vec::new(),
                }),
                executor: Executor::new(),
                fatal: RefCell::new(None),
                config: config.clone(),
            }),
        })
    }

    /// Get a handle for creating sockets, timers and tasks.
    pub fn handle(&self) -> Handle {
        Handle {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// The parameters this ring was created with.
    pub fn config(&self) -> &RingConfig {
        &self.shared.config
    }

    /// Spawn a task, running it until its first suspension point.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.shared.executor.spawn(future)
    }

    /// Flush queued submissions, wait for at least `min_count` completions or
    /// until `timeout` passes, then dispatch every completion available.
    ///
    /// A timeout is not an error. Returns the number of completions
    /// dispatched, which may be zero.
    pub fn wait_for_completions(&self, min_count: usize, timeout: Duration) -> Result<usize, Error> {
        self.shared.take_fatal()?;
        self.shared.enter(min_count, timeout)?;
        let count = self.shared.drain();
        self.shared.take_fatal()?;
        Ok(count)
    }

    /// Hand queued submissions to the kernel without waiting.
    pub fn flush(&self) -> Result<usize, Error> {
        self.shared.flush()
    }

    /// Cancel every operation in flight against `fd`.
    pub fn cancel_fd(&self, fd: RawFd) -> Result<(), Error> {
        self.shared.cancel_fd(fd)
    }

    /// Number of operation records the kernel may still complete.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Run the completion loop until an error occurs.
    pub fn run(&self) -> Result<(), Error> {
        self.run_until(&Cell::new(false))
    }

    /// Run the completion loop until `stop` is set.
    ///
    /// `stop` is checked once per wait interval and after every batch.
    pub fn run_until(&self, stop: &Cell<bool>) -> Result<(), Error> {
        let interval = self.shared.config.wait_interval();
        while !stop.get() {
            self.wait_for_completions(1, interval)?;
        }
        Ok(())
    }

    /// Spawn `future` as a task and run the loop until it finishes.
    ///
    /// Fails with [`Error::Stalled`] if the task is still pending while
    /// nothing is in flight and no task is ready, since no completion could
    /// ever resume it.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, Error>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let interval = self.shared.config.wait_interval();
        let mut task = self.spawn(future);
        loop {
            if let Some(output) = task.try_take() {
                return Ok(output);
            }
            if self.shared.in_flight() == 0 && self.shared.executor.is_idle() {
                return Err(Error::Stalled);
            }
            self.wait_for_completions(1, interval)?;
            self.shared.executor.run_ready();
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // Tasks go first; their sockets cancel whatever they had in flight.
        self.shared.executor.clear();

        let pending = self.shared.in_flight();
        if pending == 0 {
            return;
        }
        debug!(pending, "Draining in-flight operations");

        // The kernel may still write into buffers owned by the records, so
        // they have to complete before the records are freed.
        let cancel_all = io_uring::opcode::AsyncCancel2::new(types::CancelBuilder::any().all())
            .build()
            .user_data(SHUTDOWN_TOKEN);
        if !self.shared.push_raw(&cancel_all) {
            // Make room by handing the queued entries to the kernel.
            if let Err(e) = self.shared.flush() {
                warn!(error = %e, "Flush failed while draining ring");
            }
            if !self.shared.push_raw(&cancel_all) {
                warn!(pending, "Submission queue full, cannot cancel in-flight operations");
            }
        }
        for _ in 0..100 {
            if self.shared.in_flight() == 0 {
                return;
            }
            if let Err(e) = self.shared.enter(1, Duration::from_millis(10)) {
                warn!(error = %e, "Wait failed while draining ring");
                break;
            }
            self.shared.drain();
        }
        warn!(pending = self.shared.in_flight(), "Dropping ring with operations in flight");
    }
}

impl Handle {
    pub(crate) fn upgrade(&self) -> Result<Rc<Shared>, Error> {
        self.shared.upgrade().ok_or(Error::RingGone)
    }

    /// Whether the ring behind this handle still exists.
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    /// Spawn a task on the ring, running it until its first suspension
    /// point.
    pub fn spawn<F>(&self, future: F) -> Result<Task<F::Output>, Error>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        Ok(self.upgrade()?.executor.spawn(future))
    }

    /// Cancel every operation in flight against `fd`.
    pub fn cancel_fd(&self, fd: RawFd) -> Result<(), Error> {
        self.upgrade()?.cancel_fd(fd)
    }

    pub(crate) fn submit(
        &self,
        request: Request,
        handler: Handler,
        continuation: Option<Waker>,
    ) -> Result<u64, (Error, Request)> {
        match self.upgrade() {
            Ok(shared) => shared.submit(request, handler, continuation),
            Err(err) => Err((err, request)),
        }
    }

    pub(crate) fn poll_completion(
        &self,
        token: u64,
        waker: &Waker,
    ) -> Result<Poll<(Request, Completion)>, Error> {
        match self.upgrade()?.poll_completion(token, waker) {
            Poll::Ready(Some(done)) => Ok(Poll::Ready(done)),
            Poll::Ready(None) => Err(Error::RingGone),
            Poll::Pending => Ok(Poll::Pending),
        }
    }

    pub(crate) fn poll_stream(&self, token: u64, waker: &Waker) -> Result<StreamPoll, Error> {
        Ok(self.upgrade()?.poll_stream(token, waker))
    }

    pub(crate) fn abandon(&self, token: u64) {
        if let Ok(shared) = self.upgrade() {
            shared.abandon(token);
        }
    }
}

/// Build a small ring for tests.
#[cfg(test)]
pub(crate) fn test_ring() -> Ring {
    let config = RingConfig {
        sq_entries: 64,
        wait_interval_ms: 50,
        ..RingConfig::default()
    };
    Ring::new(&config).expect("io_uring setup")
}
