//! Per-session frame buffer.

use bytes::Bytes;

/// Append-only, arrival-ordered frame payloads of one capture session.
///
/// The buffer is sized for the session's target frame count. It never
/// refuses a frame; the session table closes the session at the target.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    frames: Vec<Bytes>,
    total_bytes: usize,
}

impl FrameBuffer {
    /// Create a buffer preallocated for `expected` frames.
    pub fn new(expected: usize) -> Self {
        Self {
            frames: Vec::with_capacity(expected),
            total_bytes: 0,
        }
    }

    pub fn push(&mut self, frame: Bytes) {
        self.total_bytes += frame.len();
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sum of all buffered payload sizes.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }
}
