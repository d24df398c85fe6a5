//! Fixed-size buffer pool.
//!
//! Operations on the ring take ownership of their buffers for as long as the
//! kernel may touch them, so the pool hands out owned `Vec<u8>`s and takes
//! them back once the operation has returned them. Reusing buffers keeps
//! allocation off the per-read path.

/// Pool of equally sized byte buffers.
///
/// Buffers are pre-allocated and reused. At most `count` buffers are out at
/// a time; the pool tracks how many are checked out.
pub struct BufferPool {
    /// Buffers available for checkout (LIFO for cache locality).
    free: Vec<Vec<u8>>,
    /// Size of each buffer.
    buffer_size: usize,
    /// Total number of buffers the pool manages.
    count: usize,
    /// Buffers currently checked out.
    outstanding: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let free = (0..count).map(|_| vec![0u8; size]).collect();
        Self {
            free,
            buffer_size: size,
            count,
            outstanding: 0,
        }
    }

    /// Take a buffer out of the pool. Its length is the pool's buffer size.
    ///
    /// Returns `None` if every buffer is checked out.
    pub fn checkout(&mut self) -> Option<Vec<u8>> {
        let buf = self.free.pop()?;
        self.outstanding += 1;
        Some(buf)
    }

    /// Return a buffer to the pool.
    ///
    /// Buffers that have been shrunk below the pool's buffer size are
    /// dropped, and a fresh one takes their place.
    pub fn checkin(&mut self, mut buf: Vec<u8>) {
        debug_assert!(self.outstanding > 0, "checkin without checkout");
        self.outstanding = self.outstanding.saturating_sub(1);
        if buf.capacity() < self.buffer_size {
            buf = vec![0u8; self.buffer_size];
        } else {
            buf.resize(self.buffer_size, 0);
        }
        self.free.push(buf);
    }

    /// Get the size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the total number of buffers.
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Get the number of available buffers.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Get the number of buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}
