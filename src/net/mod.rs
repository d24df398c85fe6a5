//! TCP networking on top of the ring.

mod acceptor;
pub mod addr;
mod server;
mod socket;

pub use acceptor::{Accept, Acceptor};
pub use addr::{AddrParseError, Ipv4Address, Port};
pub use server::{tcp_server, DEFAULT_BACKLOG};
pub use socket::{ConnectFuture, RecvFuture, SendFuture, SocketState, TcpSocket};
