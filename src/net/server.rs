//! Listening socket bootstrap.

use super::addr::{Ipv4Address, Port};
use super::socket::TcpSocket;
use crate::runtime::{Handle, Scheduler};
use std::io;
use std::time::Duration;
use tracing::{info, warn};

/// Listen backlog for server sockets.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Create a listening socket on `ip:port`.
///
/// `SO_REUSEADDR` is set so a restarted server can bind while old
/// connections linger in `TIME_WAIT`. If the address is still in use, a
/// warning is logged and the bind is retried after `retry_delay`, awaiting a
/// timer so the ring keeps serving other tasks in the meantime. Other bind
/// errors are returned.
pub async fn tcp_server(
    handle: Handle,
    ip: Ipv4Address,
    port: Port,
    retry_delay: Duration,
) -> io::Result<TcpSocket> {
    let scheduler = Scheduler::new(&handle);
    let mut socket = TcpSocket::new(&handle)?;
    socket.set_reuse_address(true)?;

    let mut attempt = 1u32;
    loop {
        match socket.bind(ip, port) {
            Ok(()) => break,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(
                    %ip,
                    %port,
                    attempt,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "Address in use, will retry bind"
                );
                scheduler.create_timer(retry_delay).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }

    socket.listen(DEFAULT_BACKLOG)?;
    info!(%ip, %port, fd = socket.fd(), attempts = attempt, "Listening");
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::SocketState;
    use crate::runtime::test_ring;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_listens_on_requested_port() {
        let ring = test_ring();
        let handle = ring.handle();

        let socket = ring
            .block_on(tcp_server(
                handle,
                Ipv4Address::LOOPBACK,
                Port(0),
                Duration::from_millis(10),
            ))
            .unwrap()
            .unwrap();
        assert_eq!(socket.state(), SocketState::Listening);
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_bind_retry_until_address_frees() {
        let ring = test_ring();
        let handle = ring.handle();

        // Hold the port with a plain listener that doesn't allow reuse.
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = Port(blocker.local_addr().unwrap().port());

        let ticks = Rc::new(Cell::new(0));
        let counter = Rc::clone(&ticks);
        let scheduler = Scheduler::new(&ring.handle());
        let blocker = Rc::new(Cell::new(Some(blocker)));
        let release = Rc::clone(&blocker);

        // Frees the port after a few timer ticks.
        drop(ring.spawn(async move {
            for _ in 0..3 {
                scheduler.create_timer(Duration::from_millis(10)).await.unwrap();
                counter.set(counter.get() + 1);
            }
            release.take();
        }));

        let socket = ring
            .block_on(tcp_server(
                handle,
                Ipv4Address::LOOPBACK,
                port,
                Duration::from_millis(5),
            ))
            .unwrap()
            .unwrap();

        // The other task kept running while the bind was retried.
        assert_eq!(ticks.get(), 3);
        assert_eq!(socket.state(), SocketState::Listening);
        assert_eq!(socket.local_addr().unwrap().port(), port.0);
    }
}
