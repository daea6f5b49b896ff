//! Fixed-capacity byte buffers for the per-connection receive and send
//! queues. Content is kept contiguous at the front; consuming a prefix
//! compacts the remainder with a block move.

pub struct FixedBuf {
    data: Box<[u8]>,
    used: usize,
}

impl FixedBuf {
    pub fn with_capacity(cap: usize) -> FixedBuf {
        FixedBuf {
            data: vec![0u8; cap].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Writable tail; pair with [`advance`](Self::advance) after filling.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        self.used += n;
    }

    /// Appends if it fits, returns false otherwise.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free() {
            return false;
        }
        self.data[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        true
    }

    /// Discards the first `n` bytes and shifts the rest down.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.used);
        self.data.copy_within(n..self.used, 0);
        self.used -= n;
    }
}
