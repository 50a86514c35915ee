//! Growable in-memory destination for compressed output

use std::io::{self, Write};
use tracing::debug;

/// Growth policy of an [`OutputBuffer`].
///
/// The buffer starts at `initial_capacity` bytes and is multiplied by `factor`
/// every time the write cursor would run past the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthPolicy {
    pub initial_capacity: usize,
    pub factor: usize,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            initial_capacity: 4096,
            factor: 2,
        }
    }
}

/// Byte sink the encoder writes into.
///
/// Storage is allocated on the first [`begin`](Self::begin) and kept across
/// images, so a steady stream of frames of similar size stops reallocating
/// after the first few.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
    written: usize,
    policy: GrowthPolicy,
}

impl OutputBuffer {
    pub fn new(policy: GrowthPolicy) -> Self {
        // factor < 2 would never make room
        let policy = GrowthPolicy {
            initial_capacity: policy.initial_capacity.max(1),
            factor: policy.factor.max(2),
        };

        Self {
            data: Vec::new(),
            written: 0,
            policy,
        }
    }

    pub fn policy(&self) -> GrowthPolicy {
        self.policy
    }

    /// Rewinds the cursor for a new image, allocating the initial capacity if needed.
    pub fn begin(&mut self) {
        if self.data.is_empty() {
            self.data = vec![0; self.policy.initial_capacity];
        }
        self.written = 0;
    }

    pub fn push(&mut self, byte: u8) {
        if self.free_in_buffer() == 0 {
            self.grow();
        }
        self.data[self.written] = byte;
        self.written += 1;
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        while self.free_in_buffer() < bytes.len() {
            self.grow();
        }
        self.data[self.written..self.written + bytes.len()].copy_from_slice(bytes);
        self.written += bytes.len();
    }

    /// Total allocated space.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Space left before the next growth step.
    pub fn free_in_buffer(&self) -> usize {
        self.data.len() - self.written
    }

    /// Bytes produced so far: capacity minus remaining space.
    pub fn len(&self) -> usize {
        self.capacity() - self.free_in_buffer()
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.written]
    }

    /// Frees the storage; the next `begin` starts over at the initial capacity.
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.written = 0;
    }

    fn grow(&mut self) {
        let new_capacity = if self.data.is_empty() {
            self.policy.initial_capacity
        } else {
            self.data.len() * self.policy.factor
        };
        debug!(from = self.data.len(), to = new_capacity, "Growing JPEG output buffer");
        self.data.resize(new_capacity, 0);
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(GrowthPolicy::default())
    }
}
