//! Connection bookkeeping for servers running on the ring.
//!
//! Each connection tracks its current state (reading, writing, closing)
//! and when data last moved, so an idle monitor can decide when to drop it.

use slab::Slab;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for data to be read.
    Reading,
    /// Writing data back to the peer.
    Writing {
        /// Bytes already written.
        written: usize,
        /// Total bytes to write.
        total: usize,
    },
    /// Connection is being closed.
    Closing,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// File descriptor for the socket.
    pub fd: RawFd,
    /// Current connection state.
    pub state: ConnState,
    /// Last time bytes were received or sent.
    pub last_activity: Instant,
    /// Bytes echoed back over the connection's lifetime.
    pub bytes_echoed: u64,
}

impl Connection {
    /// Create a new connection in initial reading state.
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: ConnState::Reading,
            last_activity: Instant::now(),
            bytes_echoed: 0,
        }
    }

    /// Record that data moved just now.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// How long the connection has been quiet.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Transition to writing state.
    pub fn start_writing(&mut self, total: usize) {
        self.state = ConnState::Writing { written: 0, total };
    }

    /// Account for a completed send. Returns true once everything has been
    /// written, at which point the connection is back to reading.
    pub fn advance_write(&mut self, n: usize) -> bool {
        self.touch();
        self.bytes_echoed += n as u64;
        if let ConnState::Writing { written, total } = &mut self.state {
            *written += n;
            if *written >= *total {
                self.state = ConnState::Reading;
                return true;
            }
            return false;
        }
        true
    }

    /// The part of the buffer still to be written, if a write is in
    /// progress.
    pub fn pending_write(&self) -> Option<Range<usize>> {
        match self.state {
            ConnState::Writing { written, total } if written < total => Some(written..total),
            _ => None,
        }
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.connections.iter()
    }
}
