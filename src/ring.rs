//! Hardware/application pointer arithmetic for the shared ring buffer.
//!
//! Both counters advance monotonically modulo `boundary`, never modulo
//! `buffer_size`; that is what keeps "buffer full" and "buffer empty"
//! distinguishable when the two physical positions coincide. The boundary is
//! a power-of-two multiple of the buffer size, so one add or subtract of
//! `boundary` is always enough to bring a raw difference back in range.

/// Ring-buffer counter state for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPointers {
    /// Frames the backend has consumed (playback) or produced (capture).
    pub hw_ptr: u64,
    /// Frames the application has supplied (playback) or retrieved (capture).
    pub appl_ptr: u64,
    /// Wraparound modulus for both counters.
    pub boundary: u64,
    /// Size of the physical ring, in frames.
    pub buffer_size: u64,
}

/// Largest power-of-two multiple of `buffer_size` that still leaves doubling
/// headroom below `i64::MAX`, so signed distance math cannot overflow.
pub fn boundary_for(buffer_size: u64) -> u64 {
    let mut boundary = buffer_size;
    while boundary * 2 <= i64::MAX as u64 - buffer_size {
        boundary *= 2;
    }
    boundary
}

impl RingPointers {
    /// Fresh pointer state for a ring of `buffer_size` frames.
    pub fn new(buffer_size: u64) -> Self {
        Self {
            hw_ptr: 0,
            appl_ptr: 0,
            boundary: boundary_for(buffer_size),
            buffer_size,
        }
    }

    fn wrap(&self, raw: i64) -> u64 {
        // Both pointers stay in [0, boundary), so the raw difference lies in
        // (-boundary, 2 * boundary) and one adjustment suffices.
        let boundary = self.boundary as i64;
        let adjusted = if raw < 0 {
            raw + boundary
        } else if raw >= boundary {
            raw - boundary
        } else {
            raw
        };
        adjusted as u64
    }

    /// Frames the application may write without overwriting unread data.
    pub fn playback_avail(&self) -> u64 {
        self.wrap(self.hw_ptr as i64 + self.buffer_size as i64 - self.appl_ptr as i64)
    }

    /// Frames queued in the ring, waiting for the backend to consume.
    pub fn playback_hw_avail(&self) -> u64 {
        self.buffer_size - self.playback_avail()
    }

    /// Frames the application may read.
    pub fn capture_avail(&self) -> u64 {
        self.wrap(self.hw_ptr as i64 - self.appl_ptr as i64)
    }

    /// Advance the application pointer by `frames`.
    pub fn appl_forward(&mut self, frames: u64) {
        self.appl_ptr = (self.appl_ptr + frames) % self.boundary;
    }

    /// Retreat the application pointer by `frames` (rewind). Callers clamp
    /// `frames` to the legally rewindable range first.
    pub fn appl_backward(&mut self, frames: u64) {
        self.appl_ptr = self.wrap(self.appl_ptr as i64 - frames as i64);
    }

    /// Advance the hardware pointer. Only the code standing in for the
    /// backend's interrupt path calls this, never the transfer engine.
    pub fn hw_forward(&mut self, frames: u64) {
        self.hw_ptr = (self.hw_ptr + frames) % self.boundary;
    }

    /// Physical frame offset of the hardware pointer inside the ring.
    pub fn hw_offset(&self) -> u64 {
        self.hw_ptr % self.buffer_size
    }

    /// Physical frame offset of the application pointer inside the ring.
    pub fn appl_offset(&self) -> u64 {
        self.appl_ptr % self.buffer_size
    }

    /// Contiguous frames from the application offset to the physical end of
    /// the ring; transfers longer than this split at the wrap.
    pub fn appl_run(&self) -> u64 {
        self.buffer_size - self.appl_offset()
    }

    /// Reset both counters, as `prepare` does.
    pub fn reset(&mut self) {
        self.hw_ptr = 0;
        self.appl_ptr = 0;
    }
}
