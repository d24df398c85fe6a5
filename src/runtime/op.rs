//! Operation records and the future that drives a single-shot request.
//!
//! A [`Record`] is everything the ring keeps about one submitted request:
//! the request payload (whose memory the kernel may touch until the
//! completion arrives), the routine that consumes the completion, the waker
//! of the suspended task and the completion itself once it has landed.

use super::ring::{Handle, StreamPoll};
use io_uring::{opcode, squeue, types};
use socket2::SockAddr;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::mem;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// Raw completion as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion {
    pub result: i32,
    pub flags: u32,
}

impl Completion {
    /// Interpret the result the usual way: negative values are `-errno`.
    pub fn into_result(self) -> io::Result<u32> {
        if self.result < 0 {
            Err(io::Error::from_raw_os_error(-self.result))
        } else {
            Ok(self.result as u32)
        }
    }

    /// Whether a multishot request stays armed after this completion.
    pub fn has_more(&self) -> bool {
        io_uring::cqueue::more(self.flags)
    }
}

/// Request payload. Owned buffers and addresses live here, so they stay put
/// for as long as the record does.
pub(crate) enum Request {
    Connect { fd: RawFd, addr: Box<SockAddr> },
    Send { fd: RawFd, buf: Vec<u8>, range: Range<usize> },
    Recv { fd: RawFd, buf: Vec<u8> },
    AcceptMulti { fd: RawFd },
    Timeout { ts: Box<types::Timespec>, absolute: bool },
    Cancel { fd: RawFd },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "connect",
            Request::Send { .. } => "send",
            Request::Recv { .. } => "recv",
            Request::AcceptMulti { .. } => "accept_multi",
            Request::Timeout { .. } => "timeout",
            Request::Cancel { .. } => "cancel",
        }
    }

    /// Build the submission entry. Every pointer in it refers to memory owned
    /// by `self`.
    pub fn build(&mut self) -> squeue::Entry {
        match self {
            Request::Connect { fd, addr } => {
                opcode::Connect::new(types::Fd(*fd), addr.as_ptr(), addr.len()).build()
            }
            Request::Send { fd, buf, range } => {
                let chunk = &buf[range.clone()];
                opcode::Send::new(types::Fd(*fd), chunk.as_ptr(), io_len(chunk.len())).build()
            }
            Request::Recv { fd, buf } => {
                opcode::Recv::new(types::Fd(*fd), buf.as_mut_ptr(), io_len(buf.len())).build()
            }
            Request::AcceptMulti { fd } => opcode::AcceptMulti::new(types::Fd(*fd)).build(),
            Request::Timeout { ts, absolute } => {
                let mut timeout = opcode::Timeout::new(&**ts as *const types::Timespec);
                if *absolute {
                    timeout = timeout.flags(types::TimeoutFlags::ABS);
                }
                timeout.build()
            }
            Request::Cancel { fd } => {
                opcode::AsyncCancel2::new(types::CancelBuilder::fd(types::Fd(*fd)).all()).build()
            }
        }
    }

    /// Dispose of a stray result nobody is going to consume. Accepted
    /// descriptors are closed so they don't leak.
    fn discard(&self, completion: Completion) {
        if let Request::AcceptMulti { fd } = self {
            if completion.result > 0 {
                tracing::debug!(
                    listener = fd,
                    fd = completion.result,
                    "Closing connection accepted after acceptor was dropped"
                );
                unsafe { libc::close(completion.result) };
            }
        }
    }
}

fn io_len(len: usize) -> u32 {
    len.min(u32::MAX as usize) as u32
}

/// Completion routine of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handler {
    /// Store the completion and resume the suspended task.
    Resume,
    /// Queue every completion of a multishot request and resume the consumer.
    Multishot,
    /// Fire and forget. The record is released as soon as it completes.
    Discard,
}

/// What has arrived for a record so far.
pub(crate) enum Response {
    Pending,
    Ready(Completion),
    Stream {
        queue: VecDeque<Completion>,
        armed: bool,
    },
}

/// Outcome of dispatching one completion to its record.
pub(crate) enum Dispatch {
    /// Keep the record, and wake this task if there is one.
    Keep(Option<Waker>),
    /// The record is finished with and can be freed.
    Release,
}

/// One in-flight request.
pub(crate) struct Record {
    pub request: Request,
    pub handler: Handler,
    pub continuation: Option<Waker>,
    pub response: Response,
    /// The awaiting side went away; completions are dropped on arrival.
    pub abandoned: bool,
}

impl Record {
    pub fn new(request: Request, handler: Handler, continuation: Option<Waker>) -> Self {
        let response = match handler {
            Handler::Multishot => Response::Stream {
                queue: VecDeque::new(),
                armed: true,
            },
            Handler::Resume | Handler::Discard => Response::Pending,
        };
        Self {
            request,
            handler,
            continuation,
            response,
            abandoned: false,
        }
    }

    /// Run the completion routine for one completion.
    pub fn complete(&mut self, completion: Completion) -> Dispatch {
        match self.handler {
            Handler::Discard => Dispatch::Release,
            Handler::Resume => {
                if self.abandoned {
                    return Dispatch::Release;
                }
                self.response = Response::Ready(completion);
                Dispatch::Keep(self.continuation.take())
            }
            Handler::Multishot => {
                let ended = completion.result <= 0 || !completion.has_more();
                if self.abandoned {
                    self.request.discard(completion);
                    return if ended {
                        Dispatch::Release
                    } else {
                        Dispatch::Keep(None)
                    };
                }
                if let Response::Stream { queue, armed } = &mut self.response {
                    queue.push_back(completion);
                    if ended {
                        *armed = false;
                    }
                }
                Dispatch::Keep(self.continuation.take())
            }
        }
    }

    /// Mark the record as having no consumer any more.
    ///
    /// Returns true if the record can be freed right away.
    pub fn abandon(&mut self) -> bool {
        self.continuation = None;
        match &mut self.response {
            Response::Ready(_) => true,
            Response::Pending => {
                self.abandoned = true;
                false
            }
            Response::Stream { queue, armed } => {
                for completion in queue.drain(..) {
                    self.request.discard(completion);
                }
                self.abandoned = true;
                !*armed
            }
        }
    }

    /// Take the next queued completion of a multishot record.
    pub fn poll_stream(&mut self, waker: &Waker) -> StreamPoll {
        match &mut self.response {
            Response::Stream { queue, armed } => match queue.pop_front() {
                Some(completion) => StreamPoll::Item {
                    completion,
                    ended: queue.is_empty() && !*armed,
                },
                None if !*armed => StreamPoll::Ended,
                None => {
                    set_continuation(&mut self.continuation, waker);
                    StreamPoll::Pending
                }
            },
            _ => StreamPoll::Ended,
        }
    }
}

pub(crate) fn set_continuation(slot: &mut Option<Waker>, waker: &Waker) {
    match slot {
        Some(current) if current.will_wake(waker) => {}
        _ => *slot = Some(waker.clone()),
    }
}

/// A single-shot request type: how to turn it into a [`Request`] and how to
/// turn the completion back into a typed result.
pub(crate) trait Operation: Unpin {
    type Output;

    fn into_request(self) -> Request;

    /// Produce the result from the request payload and the kernel outcome.
    fn complete(request: Request, result: io::Result<u32>) -> Self::Output;

    /// Result for an operation whose record vanished with the ring.
    fn orphaned(err: io::Error) -> Self::Output;
}

enum State<T> {
    Idle(T),
    Rejected(T, io::Error),
    InFlight(u64),
    Done,
}

/// Future for one single-shot request.
///
/// Nothing is submitted until the first poll. That poll registers the
/// record, queues the submission entry and suspends; the ring flushes the
/// entry the next time it waits for completions. Dropping the future while
/// the request is in flight leaves the record to be released by its
/// completion.
pub(crate) struct Op<T: Operation> {
    handle: Handle,
    state: State<T>,
}

impl<T: Operation> Op<T> {
    pub fn new(handle: &Handle, op: T) -> Self {
        Self {
            handle: handle.clone(),
            state: State::Idle(op),
        }
    }

    /// An operation that fails with `err` without reaching the kernel.
    pub fn rejected(handle: &Handle, op: T, err: io::Error) -> Self {
        Self {
            handle: handle.clone(),
            state: State::Rejected(op, err),
        }
    }
}

impl<T: Operation> Future for Op<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match mem::replace(&mut this.state, State::Done) {
            State::Idle(op) => {
                let request = op.into_request();
                match this
                    .handle
                    .submit(request, Handler::Resume, Some(cx.waker().clone()))
                {
                    Ok(token) => {
                        this.state = State::InFlight(token);
                        Poll::Pending
                    }
                    Err((err, request)) => Poll::Ready(T::complete(request, Err(err.to_io_error()))),
                }
            }
            State::Rejected(op, err) => Poll::Ready(T::complete(op.into_request(), Err(err))),
            State::InFlight(token) => match this.handle.poll_completion(token, cx.waker()) {
                Ok(Poll::Ready((request, completion))) => {
                    Poll::Ready(T::complete(request, completion.into_result()))
                }
                Ok(Poll::Pending) => {
                    this.state = State::InFlight(token);
                    Poll::Pending
                }
                Err(err) => Poll::Ready(T::orphaned(err.to_io_error())),
            },
            State::Done => panic!("operation polled after completion"),
        }
    }
}

impl<T: Operation> Drop for Op<T> {
    fn drop(&mut self) {
        if let State::InFlight(token) = self.state {
            self.handle.abandon(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_record() -> Record {
        Record::new(Request::AcceptMulti { fd: -1 }, Handler::Multishot, None)
    }

    #[test]
    fn test_completion_result() {
        let ok = Completion { result: 5, flags: 0 };
        assert_eq!(ok.into_result().unwrap(), 5);

        let err = Completion {
            result: -libc::ECONNREFUSED,
            flags: 0,
        };
        assert_eq!(
            err.into_result().unwrap_err().raw_os_error(),
            Some(libc::ECONNREFUSED)
        );
    }

    #[test]
    fn test_resume_stores_completion() {
        let mut record = Record::new(Request::Cancel { fd: 3 }, Handler::Resume, None);
        let done = Completion { result: 0, flags: 0 };
        assert!(matches!(record.complete(done), Dispatch::Keep(None)));
        assert!(matches!(record.response, Response::Ready(c) if c == done));
        // A completed record with no consumer left can go at once.
        assert!(record.abandon());
    }

    #[test]
    fn test_abandoned_single_shot_is_released() {
        let mut record = Record::new(Request::Cancel { fd: 3 }, Handler::Resume, None);
        assert!(!record.abandon());
        assert!(matches!(
            record.complete(Completion { result: 0, flags: 0 }),
            Dispatch::Release
        ));
    }

    #[test]
    fn test_discard_releases() {
        let mut record = Record::new(Request::Cancel { fd: 3 }, Handler::Discard, None);
        assert!(matches!(
            record.complete(Completion {
                result: -libc::ENOENT,
                flags: 0
            }),
            Dispatch::Release
        ));
    }

    #[test]
    fn test_multishot_queues_until_ended() {
        let waker = Waker::noop();
        let mut record = accept_record();
        // IORING_CQE_F_MORE
        let more = 1 << 1;

        record.complete(Completion {
            result: -libc::EMFILE,
            flags: more,
        });
        record.complete(Completion {
            result: -libc::ECANCELED,
            flags: 0,
        });

        match record.poll_stream(waker) {
            StreamPoll::Item { completion, ended } => {
                assert_eq!(completion.result, -libc::EMFILE);
                assert!(!ended);
            }
            _ => panic!("expected a queued completion"),
        }
        match record.poll_stream(waker) {
            StreamPoll::Item { completion, ended } => {
                assert_eq!(completion.result, -libc::ECANCELED);
                assert!(ended);
            }
            _ => panic!("expected a queued completion"),
        }
        assert!(matches!(record.poll_stream(waker), StreamPoll::Ended));
    }

    #[test]
    fn test_armed_stream_registers_waker() {
        let mut record = accept_record();
        assert!(matches!(
            record.poll_stream(Waker::noop()),
            StreamPoll::Pending
        ));
        assert!(record.continuation.is_some());
        // Still armed, so the record must wait for its final completion.
        assert!(!record.abandon());
        assert!(record.continuation.is_none());
    }
}
