//! Socket-side buffers of a client connection.

/// Read and write buffers for one connection.
///
/// `read_buffer` accumulates raw socket bytes until whole backend messages
/// are available; `write_buffer[write_pos..]` is what still has to be sent.
#[derive(Debug)]
pub struct BufferSet {
    /// Bytes received but not yet parsed
    pub read_buffer: Vec<u8>,
    /// Encoded frontend messages
    pub write_buffer: Vec<u8>,
    /// Number of leading `write_buffer` bytes already sent
    pub write_pos: usize,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(8192),
            write_pos: 0,
        }
    }

    /// Bytes still waiting to be written.
    pub fn pending_write(&self) -> &[u8] {
        self.write_buffer.get(self.write_pos..).unwrap_or_default()
    }

    /// Record that `n` more bytes were written.
    pub fn advance_write(&mut self, n: usize) {
        self.write_pos += n;
        if self.write_pos >= self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_pos = 0;
        }
    }

    /// Drop the first `n` bytes of the read buffer.
    pub fn consume_read(&mut self, n: usize) {
        self.read_buffer.drain(..n.min(self.read_buffer.len()));
    }

    /// Forget everything, as after a reconnect.
    pub fn clear(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.write_pos = 0;
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
