//! TCP sockets whose I/O runs on the ring.
//!
//! `connect`, `send` and `recv` return futures. Buffers are moved into the
//! operation for as long as the kernel may use them and handed back with the
//! result, so a caller can reuse the same allocation for every transfer.

use super::acceptor::Acceptor;
use super::addr::{self, Ipv4Address, Port};
use crate::runtime::op::{Op, Operation, Request};
use crate::runtime::Handle;
use crate::Error;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddrV4;
use std::ops::Range;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tracing::{debug, warn};

/// Lifecycle of a [`TcpSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closed,
}

/// An IPv4 TCP socket bound to a ring.
///
/// Dropping the socket cancels whatever the kernel still has in flight for
/// its descriptor, then closes it. Operation records only ever hold a copy
/// of the raw descriptor, never a reference to the socket. The futures that
/// submit them borrow the socket, so it cannot be closed before they run.
pub struct TcpSocket {
    handle: Handle,
    socket: Option<Socket>,
    state: SocketState,
}

impl TcpSocket {
    /// Open a new, unbound socket.
    pub fn new(handle: &Handle) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        debug!(fd = socket.as_raw_fd(), "Opened socket");
        Ok(Self {
            handle: handle.clone(),
            socket: Some(socket),
            state: SocketState::Unbound,
        })
    }

    /// Adopt a descriptor produced by an accept completion.
    pub(crate) fn from_accepted(handle: &Handle, fd: RawFd) -> Self {
        // The kernel just handed us this descriptor; nothing else owns it.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        Self {
            handle: handle.clone(),
            socket: Some(socket),
            state: SocketState::Connected,
        }
    }

    /// The raw descriptor, or `None` once the socket is closed.
    pub fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    fn inner(&self) -> io::Result<&Socket> {
        self.socket.as_ref().ok_or_else(closed)
    }

    /// Allow rebinding a local address still in `TIME_WAIT`.
    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.inner()?.set_reuse_address(reuse)
    }

    /// Bind to a local address. Port 0 picks an ephemeral port.
    pub fn bind(&mut self, ip: Ipv4Address, port: Port) -> io::Result<()> {
        self.inner()?.bind(&addr::sock_addr(ip, port))?;
        self.state = SocketState::Bound;
        Ok(())
    }

    /// Start listening for connections.
    pub fn listen(&mut self, backlog: i32) -> io::Result<()> {
        self.inner()?.listen(backlog)?;
        self.state = SocketState::Listening;
        Ok(())
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        self.inner()?
            .local_addr()?
            .as_socket_ipv4()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an IPv4 socket"))
    }

    /// Connect to a remote address.
    ///
    /// On failure the socket is closed and the error carries the kernel
    /// error code.
    pub fn connect(&mut self, ip: Ipv4Address, port: Port) -> ConnectFuture<'_> {
        let addr = Box::new(addr::sock_addr(ip, port));
        let op = match self.fd() {
            Some(fd) => {
                self.state = SocketState::Connecting;
                debug!(fd, %ip, %port, "Connecting");
                Op::new(&self.handle, ConnectOp { fd, addr })
            }
            None => Op::rejected(&self.handle, ConnectOp { fd: -1, addr }, closed()),
        };
        ConnectFuture { socket: self, op }
    }

    /// Send the whole of `buf`.
    ///
    /// Resolves to the number of bytes the kernel took, which may be fewer
    /// than `buf.len()`, together with the buffer.
    pub fn send(&self, buf: impl Into<Vec<u8>>) -> SendFuture<'_> {
        let buf = buf.into();
        let range = 0..buf.len();
        self.send_range(buf, range)
    }

    /// Send `buf[range]`. Used to resume after a short send without copying.
    pub fn send_range(&self, buf: Vec<u8>, range: Range<usize>) -> SendFuture<'_> {
        let op = SendOp {
            fd: self.fd().unwrap_or(-1),
            buf,
            range,
        };
        let op = if op.range.start > op.range.end || op.range.end > op.buf.len() {
            Op::rejected(&self.handle, op, invalid_input("send range out of bounds"))
        } else {
            match self.check_connected() {
                Ok(()) => Op::new(&self.handle, op),
                Err(e) => Op::rejected(&self.handle, op, e),
            }
        };
        SendFuture { _socket: self, op }
    }

    /// Receive into `buf`, filling at most `buf.len()` bytes.
    ///
    /// Resolves to the number of bytes received together with the buffer.
    /// `Ok(0)` means the peer closed the connection.
    pub fn recv(&self, buf: Vec<u8>) -> RecvFuture<'_> {
        let op = RecvOp {
            fd: self.fd().unwrap_or(-1),
            buf,
        };
        let op = if op.buf.is_empty() {
            Op::rejected(&self.handle, op, invalid_input("receive buffer is empty"))
        } else {
            match self.check_connected() {
                Ok(()) => Op::new(&self.handle, op),
                Err(e) => Op::rejected(&self.handle, op, e),
            }
        };
        RecvFuture { _socket: self, op }
    }

    fn check_connected(&self) -> io::Result<()> {
        match self.state {
            SocketState::Connected => Ok(()),
            SocketState::Closed => Err(closed()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is not connected",
            )),
        }
    }

    /// Turn a listening socket into an acceptor.
    pub fn acceptor(self) -> Acceptor {
        Acceptor::new(self)
    }

    /// Cancel in-flight operations on the descriptor and close it.
    ///
    /// Returns false if the socket was already closed.
    pub fn close(&mut self) -> bool {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => return false,
        };
        let fd = socket.as_raw_fd();
        match self.handle.cancel_fd(fd) {
            Ok(()) | Err(Error::RingGone) => {}
            Err(e) => warn!(fd, error = %e, "Failed to cancel operations before close"),
        }
        drop(socket);
        self.state = SocketState::Closed;
        debug!(fd, "Closed socket");
        true
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("fd", &self.fd())
            .field("state", &self.state)
            .finish()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}

fn invalid_input(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

struct ConnectOp {
    fd: RawFd,
    addr: Box<SockAddr>,
}

impl Operation for ConnectOp {
    type Output = io::Result<()>;

    fn into_request(self) -> Request {
        Request::Connect {
            fd: self.fd,
            addr: self.addr,
        }
    }

    fn complete(_request: Request, result: io::Result<u32>) -> io::Result<()> {
        result.map(|_| ())
    }

    fn orphaned(err: io::Error) -> io::Result<()> {
        Err(err)
    }
}

struct SendOp {
    fd: RawFd,
    buf: Vec<u8>,
    range: Range<usize>,
}

impl Operation for SendOp {
    type Output = (io::Result<usize>, Vec<u8>);

    fn into_request(self) -> Request {
        Request::Send {
            fd: self.fd,
            buf: self.buf,
            range: self.range,
        }
    }

    fn complete(request: Request, result: io::Result<u32>) -> Self::Output {
        match request {
            Request::Send { buf, .. } => (result.map(|n| n as usize), buf),
            other => unreachable!("send completed with a {} request", other.kind()),
        }
    }

    fn orphaned(err: io::Error) -> Self::Output {
        (Err(err), Vec::new())
    }
}

struct RecvOp {
    fd: RawFd,
    buf: Vec<u8>,
}

impl Operation for RecvOp {
    type Output = (io::Result<usize>, Vec<u8>);

    fn into_request(self) -> Request {
        Request::Recv {
            fd: self.fd,
            buf: self.buf,
        }
    }

    fn complete(request: Request, result: io::Result<u32>) -> Self::Output {
        match request {
            Request::Recv { buf, .. } => (result.map(|n| n as usize), buf),
            other => unreachable!("recv completed with a {} request", other.kind()),
        }
    }

    fn orphaned(err: io::Error) -> Self::Output {
        (Err(err), Vec::new())
    }
}

/// Future returned by [`TcpSocket::connect`].
pub struct ConnectFuture<'a> {
    socket: &'a mut TcpSocket,
    op: Op<ConnectOp>,
}

impl Future for ConnectFuture<'_> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.op).poll(cx));
        match &result {
            Ok(()) => {
                this.socket.state = SocketState::Connected;
                debug!(fd = this.socket.fd(), "Connected");
            }
            Err(e) => {
                debug!(fd = this.socket.fd(), error = %e, "Connect failed");
                this.socket.close();
            }
        }
        Poll::Ready(result)
    }
}

/// Future returned by [`TcpSocket::send`] and [`TcpSocket::send_range`].
///
/// The future borrows the socket, so the descriptor it targets stays open
/// until the request has been submitted:
///
/// ```compile_fail
/// use coop_uring::{Ring, RingConfig, TcpSocket};
///
/// let ring = Ring::new(&RingConfig::default()).unwrap();
/// let socket = TcpSocket::new(&ring.handle()).unwrap();
/// let send = socket.send("data");
/// drop(socket);
/// drop(send);
/// ```
pub struct SendFuture<'a> {
    _socket: &'a TcpSocket,
    op: Op<SendOp>,
}

impl Future for SendFuture<'_> {
    type Output = (io::Result<usize>, Vec<u8>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.op).poll(cx)
    }
}

/// Future returned by [`TcpSocket::recv`].
///
/// Like [`SendFuture`], it borrows the socket:
///
/// ```compile_fail
/// use coop_uring::{Ring, RingConfig, TcpSocket};
///
/// let ring = Ring::new(&RingConfig::default()).unwrap();
/// let mut socket = TcpSocket::new(&ring.handle()).unwrap();
/// let recv = socket.recv(vec![0u8; 16]);
/// socket.close();
/// drop(recv);
/// ```
pub struct RecvFuture<'a> {
    _socket: &'a TcpSocket,
    op: Op<RecvOp>,
}

impl Future for RecvFuture<'_> {
    type Output = (io::Result<usize>, Vec<u8>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.op).poll(cx)
    }
}
