//! Multishot accept over a listening socket.
//!
//! One kernel request produces a completion per incoming connection until it
//! ends (error, cancellation, or the kernel dropping the multishot). The
//! acceptor owns that request's record; completions landing while nobody is
//! awaiting stay queued on it.

use super::socket::{SocketState, TcpSocket};
use crate::runtime::op::{Handler, Request};
use crate::runtime::StreamPoll;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, trace};

/// Accepts connections from a listening [`TcpSocket`].
pub struct Acceptor {
    listener: TcpSocket,
    /// Token of the armed multishot request, if any.
    token: Option<u64>,
}

impl Acceptor {
    pub(crate) fn new(listener: TcpSocket) -> Self {
        Self {
            listener,
            token: None,
        }
    }

    /// The listening socket.
    pub fn socket(&self) -> &TcpSocket {
        &self.listener
    }

    /// Wait for the next connection.
    ///
    /// Arms a multishot accept if none is armed. A connection already queued
    /// is returned without suspending. A failed accept is reported as an
    /// error; the next call re-arms the request.
    pub fn accept(&mut self) -> Accept<'_> {
        Accept { acceptor: self }
    }

    fn arm(&mut self, cx: &mut Context<'_>) -> io::Result<u64> {
        let fd = match self.listener.fd() {
            Some(fd) => fd,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed")),
        };
        if self.listener.state() != SocketState::Listening {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket is not listening",
            ));
        }
        let token = self
            .listener
            .handle()
            .submit(
                Request::AcceptMulti { fd },
                Handler::Multishot,
                Some(cx.waker().clone()),
            )
            .map_err(|(err, _)| err.to_io_error())?;
        debug!(fd, token, "Armed multishot accept");
        self.token = Some(token);
        Ok(token)
    }

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<TcpSocket>> {
        loop {
            let token = match self.token {
                Some(token) => token,
                None => {
                    self.arm(cx)?;
                    return Poll::Pending;
                }
            };

            let handle = self.listener.handle();
            match handle.poll_stream(token, cx.waker()) {
                Err(err) => return Poll::Ready(Err(err.to_io_error())),
                Ok(StreamPoll::Pending) => return Poll::Pending,
                Ok(StreamPoll::Ended) => {
                    trace!(token, "Multishot accept ended");
                    self.token = None;
                }
                Ok(StreamPoll::Item { completion, ended }) => {
                    if ended {
                        trace!(token, result = completion.result, "Multishot accept ended");
                        self.token = None;
                    }
                    let result = if completion.result > 0 {
                        let socket = TcpSocket::from_accepted(handle, completion.result);
                        debug!(fd = completion.result, "Accepted connection");
                        Ok(socket)
                    } else if completion.result < 0 {
                        Err(io::Error::from_raw_os_error(-completion.result))
                    } else {
                        Err(io::Error::new(
                            io::ErrorKind::Other,
                            "accept completed without a descriptor",
                        ))
                    };
                    return Poll::Ready(result);
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            // Queued connections are closed; the request itself ends when
            // the listener is closed right after this.
            self.listener.handle().abandon(token);
        }
    }
}

/// Future returned by [`Acceptor::accept`].
pub struct Accept<'a> {
    acceptor: &'a mut Acceptor,
}

impl Future for Accept<'_> {
    type Output = io::Result<TcpSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().acceptor.poll_accept(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addr::Ipv4Address;
    use crate::net::socket::tests::loopback_listener;
    use crate::runtime::test_ring;
    use std::collections::HashSet;

    #[test]
    fn test_multishot_accepts_every_client() {
        const CLIENTS: usize = 5;

        let ring = test_ring();
        let handle = ring.handle();
        let (listener, port) = loopback_listener(&ring);

        let server = ring.spawn(async move {
            let mut acceptor = listener.acceptor();
            let mut accepted = Vec::new();
            for _ in 0..CLIENTS {
                accepted.push(acceptor.accept().await.unwrap());
            }
            accepted
        });

        let clients = ring
            .block_on(async move {
                let mut clients = Vec::new();
                for _ in 0..CLIENTS {
                    let mut client = TcpSocket::new(&handle).unwrap();
                    client.connect(Ipv4Address::LOOPBACK, port).await.unwrap();
                    clients.push(client);
                }
                clients
            })
            .unwrap();
        assert_eq!(clients.len(), CLIENTS);

        let accepted = ring.block_on(server).unwrap();
        let fds: HashSet<_> = accepted.iter().filter_map(|s| s.fd()).collect();
        assert_eq!(fds.len(), CLIENTS);
        assert!(accepted
            .iter()
            .all(|s| s.state() == SocketState::Connected));
    }

    #[test]
    fn test_queued_connections_are_not_lost() {
        let ring = test_ring();
        let handle = ring.handle();
        let (listener, port) = loopback_listener(&ring);
        let mut acceptor = listener.acceptor();

        // Arm the request, then let two clients connect while nobody awaits.
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(acceptor.poll_accept(&mut cx).is_pending());

        let clients = ring
            .block_on(async move {
                let mut a = TcpSocket::new(&handle).unwrap();
                a.connect(Ipv4Address::LOOPBACK, port).await.unwrap();
                let mut b = TcpSocket::new(&handle).unwrap();
                b.connect(Ipv4Address::LOOPBACK, port).await.unwrap();
                (a, b)
            })
            .unwrap();

        // Accept completions may trail the connects by a drain.
        let mut accepted = Vec::new();
        for _ in 0..50 {
            while let Poll::Ready(socket) = acceptor.poll_accept(&mut cx) {
                accepted.push(socket.unwrap());
            }
            if accepted.len() == 2 {
                break;
            }
            ring.wait_for_completions(1, std::time::Duration::from_millis(10))
                .unwrap();
        }
        assert_eq!(accepted.len(), 2);
        drop(clients);
    }

    #[test]
    fn test_accept_on_non_listening_socket() {
        let ring = test_ring();
        let socket = TcpSocket::new(&ring.handle()).unwrap();
        let mut acceptor = socket.acceptor();

        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        match acceptor.poll_accept(&mut cx) {
            Poll::Ready(Err(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            _ => panic!("accept on an unbound socket must fail"),
        }
    }

    #[test]
    fn test_dropping_acceptor_releases_record() {
        let ring = test_ring();
        let (listener, _port) = loopback_listener(&ring);
        let mut acceptor = listener.acceptor();

        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(acceptor.poll_accept(&mut cx).is_pending());
        ring.flush().unwrap();
        drop(acceptor);

        for _ in 0..50 {
            if ring.in_flight() == 0 {
                break;
            }
            ring.wait_for_completions(1, std::time::Duration::from_millis(10))
                .unwrap();
        }
        assert_eq!(ring.in_flight(), 0);
    }
}
