//! Single-threaded completion runtime on top of io_uring.
//!
//! - `Ring`: the io_uring instance, the operation records and the task
//!   executor, driven by `wait_for_completions`
//! - `Task`: cooperative task, started eagerly, resumed by completions
//! - `Scheduler` / `Timer`: kernel timeouts as awaitable timers
//! - `BufferPool` / `ConnectionRegistry`: bookkeeping for servers built on
//!   the ring

mod buffer;
mod connection;
pub(crate) mod op;
mod ring;
mod task;
pub mod time;
mod timer;
mod token;

pub use buffer::BufferPool;
pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use ring::{Handle, Ring, RingConfig};
pub(crate) use ring::StreamPoll;
pub use task::Task;
pub use timer::{Scheduler, Timer};

#[cfg(test)]
pub(crate) use ring::test_ring;
