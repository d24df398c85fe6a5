//! coop-uring: a single-threaded io_uring runtime with cooperative tasks.
//!
//! Application code is written as ordinary `async fn`s. Socket and timer
//! operations submit requests to the kernel ring and suspend; a single
//! thread waits for completions, dispatches each one to its operation
//! record and resumes the task waiting on it in line.
//!
//! ```no_run
//! use coop_uring::{Ring, RingConfig, Scheduler};
//! use std::time::Duration;
//!
//! let ring = Ring::new(&RingConfig::default()).unwrap();
//! let scheduler = Scheduler::new(&ring.handle());
//! ring.block_on(async move {
//!     scheduler.create_timer(Duration::from_millis(10)).await.unwrap();
//! })
//! .unwrap();
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("coop-uring requires Linux io_uring");

pub mod config;
pub mod echo;
mod error;
pub mod net;
pub mod runtime;

pub use error::Error;
pub use net::{Acceptor, Ipv4Address, Port, SocketState, TcpSocket};
pub use runtime::{Handle, Ring, RingConfig, Scheduler, Task, Timer};
