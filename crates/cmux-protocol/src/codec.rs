//! Streaming frame decoder
//!
//! Accepts arbitrary chunks of line bytes and yields complete, checksummed
//! frames. Garbage between frames, repeated flags and corrupt frames are
//! skipped. A closing flag may double as the opening flag of the next frame.

use tracing::debug;

use crate::fcs::verify_fcs;
use crate::frame::{
    Address, Control, Frame, EA_BIT, FLAG, FRAME_OVERHEAD, HEADER_LEN, MAX_FRAME_LEN,
};

/// Streaming basic-mode frame codec
pub struct FrameCodec {
    buffer: Vec<u8>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_LEN),
        }
    }

    /// Push raw bytes into the codec buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        // Prevent unbounded growth on a line that never produces a frame
        if self.buffer.len() > MAX_FRAME_LEN * 4 {
            let start = self.buffer.len() - MAX_FRAME_LEN;
            self.buffer.drain(..start);
        }
    }

    /// Extract the next complete frame, if available
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.next_frame_with_bytes().map(|(frame, _)| frame)
    }

    /// Extract the next complete frame along with its raw bytes
    pub fn next_frame_with_bytes(&mut self) -> Option<(Frame, Vec<u8>)> {
        loop {
            let start = self.buffer.iter().position(|&b| b == FLAG)?;
            self.buffer.drain(..start);

            // Collapse inter-frame fill down to a single opening flag
            let fill = self.buffer[1..].iter().take_while(|&&b| b == FLAG).count();
            self.buffer.drain(..fill);

            if self.buffer.len() < 1 + HEADER_LEN {
                return None;
            }

            let length_octet = self.buffer[3];
            if length_octet & EA_BIT == 0 {
                debug!("Dropping frame with multi-byte length 0x{:02X}", length_octet);
                self.buffer.drain(..1);
                continue;
            }

            let total = FRAME_OVERHEAD + usize::from(length_octet >> 1);
            if self.buffer.len() < total {
                return None;
            }

            let closing = self.buffer[total - 1];
            if closing != FLAG {
                debug!("Dropping frame without closing flag (got 0x{:02X})", closing);
                self.buffer.drain(..1);
                continue;
            }

            if !verify_fcs(&self.buffer[1..1 + HEADER_LEN], self.buffer[total - 2]) {
                debug!("Dropping frame with bad FCS");
                self.buffer.drain(..total - 1);
                continue;
            }

            let raw = self.buffer[..total].to_vec();
            // Leave the closing flag in place: it may open the next frame
            self.buffer.drain(..total - 1);

            let control = Control::from_byte(raw[2]);
            if let Err(e) = control.kind() {
                debug!("Skipping frame: {}", e);
                continue;
            }

            let frame = Frame::new(
                Address::from_byte(raw[1]),
                control,
                raw[4..total - 2].to_vec(),
            );
            return Some((frame, raw));
        }
    }

    /// Clear the internal buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
