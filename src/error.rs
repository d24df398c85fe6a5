//! Ring-level error taxonomy.
//!
//! Only failures of the ring itself live here. A failed socket or timer
//! operation is reported to the awaiting task as a plain `io::Error`
//! carrying the kernel error code, and the task decides what to do with it.

use std::io;

/// Fatal errors of a [`Ring`](crate::Ring).
///
/// None of these are retried internally. Once one is returned from a wait
/// or run call, the loop that owns the ring should stop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The io_uring instance could not be created.
    #[error("failed to set up io_uring: {0}")]
    Setup(#[source] io::Error),

    /// No free submission queue entry was left for a new request.
    #[error("submission queue is full ({0} entries)")]
    SubmissionQueueFull(u32),

    /// The kernel rejected a batch of submissions.
    #[error("kernel rejected submission batch: {0}")]
    Submit(#[source] io::Error),

    /// Waiting for completions failed for a reason other than a timeout.
    #[error("waiting for completions failed: {0}")]
    Wait(#[source] io::Error),

    /// The ring behind a handle has already been dropped.
    #[error("ring has been shut down")]
    RingGone,

    /// `block_on` was asked to wait for a task that can no longer make
    /// progress: nothing is in flight and no task is ready to run.
    #[error("task cannot make progress: no operations in flight")]
    Stalled,
}

impl Error {
    /// Convert into an `io::Error` for delivery to an awaiting operation.
    ///
    /// The kernel error code is kept when there is one.
    pub(crate) fn to_io_error(&self) -> io::Error {
        match self {
            Error::Setup(e) | Error::Submit(e) | Error::Wait(e) => match e.raw_os_error() {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::new(e.kind(), e.to_string()),
            },
            Error::SubmissionQueueFull(_) => io::Error::new(io::ErrorKind::WouldBlock, self.to_string()),
            Error::RingGone => io::Error::new(io::ErrorKind::BrokenPipe, self.to_string()),
            Error::Stalled => io::Error::new(io::ErrorKind::Other, self.to_string()),
        }
    }
}
