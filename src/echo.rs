//! Echo server and client built on the ring.
//!
//! The server accepts connections with a multishot acceptor and runs one
//! task per client that writes back everything it reads. Each client also
//! gets an inactivity monitor: a task that wakes up every
//! `idle_check_interval` and disconnects the client once nothing has been
//! received for `idle_timeout`.
//!
//! The client connects, sends each message in turn and waits until the same
//! bytes have come back before sending the next one.

use crate::net::{tcp_server, Ipv4Address, Port, TcpSocket};
use crate::runtime::{BufferPool, Connection, ConnectionRegistry, Handle, Scheduler};
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Port the echo server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 56789;

/// Messages the client sends unless configured otherwise.
pub fn default_messages() -> Vec<String> {
    ["hello", "world!", "coroutines", "are", "cool"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Echo server parameters.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: Ipv4Address,
    pub port: Port,
    pub max_connections: usize,
    /// Receive buffer size per connection.
    pub buffer_size: usize,
    /// Disconnect a client after this long without receiving anything.
    pub idle_timeout: Duration,
    /// How often each client's inactivity is checked.
    pub idle_check_interval: Duration,
    /// Delay between bind attempts while the address is in use.
    pub bind_retry_delay: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: Ipv4Address::ANY,
            port: Port(DEFAULT_PORT),
            max_connections: 1024,
            buffer_size: 1024,
            idle_timeout: Duration::from_secs(10),
            idle_check_interval: Duration::from_secs(3),
            bind_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Echo client parameters.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub host: Ipv4Address,
    pub port: Port,
    pub messages: Vec<String>,
    /// Receive buffer size.
    pub buffer_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: Ipv4Address::LOOPBACK,
            port: Port(DEFAULT_PORT),
            messages: default_messages(),
            buffer_size: 4096,
        }
    }
}

struct ServerState {
    registry: RefCell<ConnectionRegistry>,
    buffers: RefCell<BufferPool>,
    settings: ServerSettings,
}

/// Bind `settings.host:settings.port` (retrying while the address is in use)
/// and serve echo clients until accepting fails for good.
pub async fn run_echo_server(handle: Handle, settings: ServerSettings) -> io::Result<()> {
    let listener = tcp_server(
        handle.clone(),
        settings.host,
        settings.port,
        settings.bind_retry_delay,
    )
    .await?;
    serve_echo(handle, listener, settings).await
}

/// Serve echo clients on an already listening socket.
pub async fn serve_echo(
    handle: Handle,
    listener: TcpSocket,
    settings: ServerSettings,
) -> io::Result<()> {
    info!(
        max_connections = settings.max_connections,
        buffer_size = settings.buffer_size,
        idle_timeout_ms = settings.idle_timeout.as_millis() as u64,
        "Echo server accepting connections"
    );
    let state = Rc::new(ServerState {
        registry: RefCell::new(ConnectionRegistry::new(settings.max_connections)),
        buffers: RefCell::new(BufferPool::new(settings.max_connections, settings.buffer_size)),
        settings,
    });
    let mut acceptor = listener.acceptor();

    loop {
        let socket = match acceptor.accept().await {
            Ok(socket) => socket,
            // Per-connection failures (EMFILE, ECONNABORTED, ...) don't stop
            // the server; cancellation of the listener and local errors do.
            Err(e) if e.raw_os_error().is_some_and(|code| code != libc::ECANCELED) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
            Err(e) => return Err(e),
        };
        let fd = match socket.fd() {
            Some(fd) => fd,
            None => continue,
        };

        let conn_id = state.registry.borrow_mut().insert(Connection::new(fd));
        let conn_id = match conn_id {
            Some(id) => id,
            None => {
                warn!(fd, "Connection limit reached, closing");
                continue;
            }
        };
        debug!(
            conn_id,
            fd,
            active = state.registry.borrow().len(),
            "Accepted connection"
        );

        let client = handle.spawn(handle_client(
            handle.clone(),
            socket,
            conn_id,
            Rc::clone(&state),
        ));
        drop(client.map_err(|e| e.to_io_error())?);
    }
}

async fn handle_client(handle: Handle, mut socket: TcpSocket, conn_id: usize, state: Rc<ServerState>) {
    let fd = socket.fd().unwrap_or(-1);
    let stopped = Rc::new(Cell::new(false));
    let monitor = handle
        .spawn(disconnect_if_idle(
            handle.clone(),
            fd,
            conn_id,
            Rc::clone(&state),
            Rc::clone(&stopped),
        ))
        .ok();

    let buf = state.buffers.borrow_mut().checkout();
    match buf {
        Some(buf) => {
            let buf = echo(&socket, conn_id, &state, &stopped, buf).await;
            state.buffers.borrow_mut().checkin(buf);
        }
        None => warn!(conn_id, fd, "No buffer available, closing"),
    }

    stopped.set(true);
    if let Some(conn) = state.registry.borrow_mut().remove(conn_id) {
        debug!(conn_id, fd, bytes_echoed = conn.bytes_echoed, "Connection closed");
    }
    socket.close();
    if let Some(monitor) = monitor {
        monitor.await;
    }
}

/// Receive and write back until the peer closes, an operation fails or the
/// monitor stops the connection. Returns the buffer for reuse.
async fn echo(
    socket: &TcpSocket,
    conn_id: usize,
    state: &ServerState,
    stopped: &Cell<bool>,
    mut buf: Vec<u8>,
) -> Vec<u8> {
    while !stopped.get() {
        let (result, returned) = socket.recv(buf).await;
        buf = returned;
        let n = match result {
            Ok(0) => {
                debug!(conn_id, "Connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(conn_id, error = %e, "Receive failed");
                break;
            }
        };
        // The connection entry tracks write progress; the idle monitor
        // closing it stops a write in progress.
        let mut pending = state.registry.borrow_mut().get_mut(conn_id).and_then(|conn| {
            conn.touch();
            conn.start_writing(n);
            conn.pending_write()
        });
        while let Some(range) = pending {
            let (result, returned) = socket.send_range(buf, range).await;
            buf = returned;
            let sent = match result {
                Ok(0) => {
                    debug!(conn_id, "Send made no progress");
                    return buf;
                }
                Ok(sent) => sent,
                Err(e) => {
                    debug!(conn_id, error = %e, "Send failed");
                    return buf;
                }
            };
            pending = state.registry.borrow_mut().get_mut(conn_id).and_then(|conn| {
                conn.advance_write(sent);
                conn.pending_write()
            });
        }
        trace!(conn_id, bytes = n, "Echoed");
    }
    buf
}

/// Periodically check a connection's last activity and cancel its
/// operations once it has been idle for too long.
async fn disconnect_if_idle(
    handle: Handle,
    fd: RawFd,
    conn_id: usize,
    state: Rc<ServerState>,
    stopped: Rc<Cell<bool>>,
) {
    let scheduler = Scheduler::new(&handle);
    let settings = &state.settings;
    debug!(conn_id, fd, "Monitoring for inactivity");

    while !stopped.get() {
        if let Err(e) = scheduler.create_timer(settings.idle_check_interval).await {
            debug!(conn_id, error = %e, "Inactivity timer failed");
            break;
        }
        if stopped.get() {
            break;
        }

        let idle_for = match state.registry.borrow().get(conn_id) {
            Some(conn) => conn.idle_for(),
            None => break,
        };
        if idle_for > settings.idle_timeout {
            info!(
                conn_id,
                fd,
                idle_ms = idle_for.as_millis() as u64,
                "Disconnecting due to inactivity"
            );
            stopped.set(true);
            if let Some(conn) = state.registry.borrow_mut().get_mut(conn_id) {
                conn.close();
            }
            if let Err(e) = handle.cancel_fd(fd) {
                warn!(conn_id, fd, error = %e, "Failed to cancel idle connection");
            }
        } else {
            trace!(conn_id, idle_ms = idle_for.as_millis() as u64, "Connection active");
        }
    }
}

/// Connect, send every message and check each one comes back intact.
///
/// Returns the number of completed round trips. A reply that differs from
/// what was sent fails with `InvalidData`; the server closing early fails
/// with `UnexpectedEof`.
pub async fn run_echo_client(handle: Handle, settings: ClientSettings) -> io::Result<usize> {
    let mut socket = TcpSocket::new(&handle)?;
    socket.connect(settings.host, settings.port).await?;
    info!(host = %settings.host, port = %settings.port, "Connected to echo server");

    let mut buf = vec![0u8; settings.buffer_size.max(1)];
    let mut round_trips = 0;
    for message in settings.messages {
        let sent = message.into_bytes();
        let len = sent.len();

        let (result, sent) = send_all(&socket, sent).await;
        result?;
        debug!(bytes = len, "Sent message");

        let mut received = Vec::with_capacity(len);
        while received.len() < len {
            let (result, returned) = socket.recv(buf).await;
            buf = returned;
            match result? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    ))
                }
                n => received.extend_from_slice(&buf[..n]),
            }
        }

        if received != sent {
            warn!(
                sent = %String::from_utf8_lossy(&sent),
                received = %String::from_utf8_lossy(&received),
                "Echo mismatch"
            );
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "echoed bytes differ from what was sent",
            ));
        }
        round_trips += 1;
        info!(message = %String::from_utf8_lossy(&received), "Received echo");
    }

    info!(round_trips, "Echo client done");
    Ok(round_trips)
}

/// Send all of `buf`, resuming after short sends.
async fn send_all(socket: &TcpSocket, mut buf: Vec<u8>) -> (io::Result<()>, Vec<u8>) {
    let len = buf.len();
    let mut written = 0;
    while written < len {
        let (result, returned) = socket.send_range(buf, written..len).await;
        buf = returned;
        match result {
            Ok(0) => {
                return (
                    Err(io::Error::new(io::ErrorKind::WriteZero, "send made no progress")),
                    buf,
                )
            }
            Ok(n) => written += n,
            Err(e) => return (Err(e), buf),
        }
    }
    (Ok(()), buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_ring;
    use std::time::Instant;

    fn listener(handle: &Handle) -> (TcpSocket, Port) {
        let mut listener = TcpSocket::new(handle).unwrap();
        listener.bind(Ipv4Address::LOOPBACK, Port(0)).unwrap();
        listener.listen(16).unwrap();
        let port = Port(listener.local_addr().unwrap().port());
        (listener, port)
    }

    #[test]
    fn test_echo_scenario() {
        let ring = test_ring();
        let handle = ring.handle();

        let server = ServerSettings {
            host: Ipv4Address::LOOPBACK,
            bind_retry_delay: Duration::from_millis(50),
            ..ServerSettings::default()
        };
        let _server = ring.spawn(run_echo_server(handle.clone(), server));

        let round_trips = ring
            .block_on(run_echo_client(handle, ClientSettings::default()))
            .unwrap()
            .unwrap();
        assert_eq!(round_trips, 5);
    }

    #[test]
    fn test_idle_client_is_disconnected() {
        let ring = test_ring();
        let handle = ring.handle();
        let (listener, port) = listener(&handle);

        let settings = ServerSettings {
            idle_timeout: Duration::from_millis(60),
            idle_check_interval: Duration::from_millis(20),
            ..ServerSettings::default()
        };
        let _server = ring.spawn(serve_echo(handle.clone(), listener, settings));

        let (first, idle) = ring
            .block_on(async move {
                let mut client = TcpSocket::new(&handle).unwrap();
                client.connect(Ipv4Address::LOOPBACK, port).await.unwrap();
                let (sent, _) = client.send("still here").await;
                sent.unwrap();
                let (n, _) = client.recv(vec![0u8; 64]).await;
                let first = n.unwrap();

                let start = Instant::now();
                let (n, _) = client.recv(vec![0u8; 64]).await;
                assert_eq!(n.unwrap(), 0);
                (first, start.elapsed())
            })
            .unwrap();

        assert_eq!(first, "still here".len());
        assert!(idle >= Duration::from_millis(40), "{:?}", idle);
    }

    #[test]
    fn test_connection_limit() {
        let ring = test_ring();
        let handle = ring.handle();
        let (listener, port) = listener(&handle);

        let settings = ServerSettings {
            max_connections: 1,
            ..ServerSettings::default()
        };
        let _server = ring.spawn(serve_echo(handle.clone(), listener, settings));

        let closed = ring
            .block_on(async move {
                let mut first = TcpSocket::new(&handle).unwrap();
                first.connect(Ipv4Address::LOOPBACK, port).await.unwrap();
                let (sent, _) = first.send("one").await;
                sent.unwrap();
                let (n, _) = first.recv(vec![0u8; 8]).await;
                assert_eq!(n.unwrap(), 3);

                let mut second = TcpSocket::new(&handle).unwrap();
                second.connect(Ipv4Address::LOOPBACK, port).await.unwrap();
                let (n, _) = second.recv(vec![0u8; 8]).await;
                n.unwrap()
            })
            .unwrap();

        assert_eq!(closed, 0);
    }

    #[test]
    fn test_client_detects_mismatch() {
        let ring = test_ring();
        let handle = ring.handle();
        let (listener, port) = listener(&handle);

        // Answers every message with the same bytes upper-cased.
        let _server = ring.spawn(async move {
            let mut acceptor = listener.acceptor();
            let peer = acceptor.accept().await.unwrap();
            let (n, mut buf) = peer.recv(vec![0u8; 64]).await;
            let n = n.unwrap();
            buf.truncate(n);
            buf.make_ascii_uppercase();
            let (sent, _) = peer.send(buf).await;
            sent.unwrap();
            std::future::pending::<()>().await;
        });

        let settings = ClientSettings {
            host: Ipv4Address::LOOPBACK,
            port,
            messages: vec!["quiet".to_string()],
            buffer_size: 64,
        };
        let err = ring
            .block_on(run_echo_client(handle, settings))
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
