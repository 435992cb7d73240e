//! Incoming frame assembly
//!
//! Frames are read straight into a fixed buffer: first the opening flag, then
//! the three header octets, then the information field plus FCS and closing
//! flag. A delivered UIH payload stays in the buffer, and reception is
//! suspended, until the owning channel has read all of it.

use std::io;

use cmux_protocol::{
    verify_fcs, Dlci, FrameError, FrameHeader, EA_BIT, FLAG, HEADER_LEN, MAX_FRAME_LEN,
    TRAILER_LEN,
};
use tracing::{trace, warn};

use crate::events::DropReason;
use crate::transport::Transport;

const INFO_START: usize = 1 + HEADER_LEN;

/// Receive pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxState {
    /// Hunting for an opening flag
    FrameStart,
    /// Reading address, control and length
    HeaderRead,
    /// Reading information, FCS and closing flag
    TrailerRead,
    /// Holding a payload for a channel
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxPoll {
    /// Transport has no more bytes
    Pending,
    /// Waiting for a channel to drain its payload
    Suspended,
    /// A complete, valid frame is in the buffer
    Frame(FrameHeader),
    /// A frame was discarded
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy)]
struct Held {
    dlci: Dlci,
    consumed: usize,
}

pub(crate) struct RxContext {
    buf: [u8; MAX_FRAME_LEN],
    offset: usize,
    remaining: usize,
    state: RxState,
    held: Option<Held>,
}

impl RxContext {
    pub(crate) fn new() -> Self {
        Self {
            buf: [0; MAX_FRAME_LEN],
            offset: 0,
            remaining: 1,
            state: RxState::FrameStart,
            held: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RxState {
        self.state
    }

    /// Pull bytes from the transport until a frame completes or input runs dry
    ///
    /// Panics on a multi-octet length field.
    pub(crate) fn poll(&mut self, transport: &mut dyn Transport) -> RxPoll {
        loop {
            match self.state {
                RxState::Suspend => return RxPoll::Suspended,
                RxState::FrameStart => {
                    if read_some(transport, &mut self.buf[..1]).is_none() {
                        return RxPoll::Pending;
                    }
                    if self.buf[0] == FLAG {
                        self.expect_header();
                    }
                }
                RxState::HeaderRead => {
                    let end = self.offset + self.remaining;
                    let Some(n) = read_some(transport, &mut self.buf[self.offset..end]) else {
                        return RxPoll::Pending;
                    };
                    let n = self.skip_fill(n);
                    self.offset += n;
                    self.remaining -= n;
                    if self.remaining == 0 {
                        let length = self.buf[INFO_START - 1];
                        assert!(
                            length & EA_BIT != 0,
                            "multi-octet length field 0x{:02X} is not supported",
                            length
                        );
                        self.remaining = usize::from(length >> 1) + TRAILER_LEN;
                        self.state = RxState::TrailerRead;
                    }
                }
                RxState::TrailerRead => {
                    let end = self.offset + self.remaining;
                    let Some(n) = read_some(transport, &mut self.buf[self.offset..end]) else {
                        return RxPoll::Pending;
                    };
                    self.offset += n;
                    self.remaining -= n;
                    if self.remaining == 0 {
                        return self.complete();
                    }
                }
            }
        }
    }

    /// Drop flag fill read where the address octet was expected
    fn skip_fill(&mut self, n: usize) -> usize {
        if self.offset != 1 {
            return n;
        }
        let fill = self.buf[1..1 + n].iter().take_while(|&&b| b == FLAG).count();
        if fill > 0 {
            self.buf.copy_within(1 + fill..1 + n, 1);
            trace!("Skipped {} fill flags", fill);
        }
        n - fill
    }

    fn complete(&mut self) -> RxPoll {
        let end = self.offset;
        if self.buf[end - 1] != FLAG {
            self.hunt();
            return RxPoll::Dropped(DropReason::MissingClosingFlag);
        }
        if !verify_fcs(&self.buf[1..INFO_START], self.buf[end - 2]) {
            self.expect_header();
            return RxPoll::Dropped(DropReason::BadFcs);
        }

        // The closing flag doubles as the next opening flag
        self.expect_header();
        match FrameHeader::parse(&self.buf[1..INFO_START]) {
            Ok(header) => RxPoll::Frame(header),
            Err(FrameError::UnsupportedFrameType(code)) => {
                RxPoll::Dropped(DropReason::UnsupportedType(code))
            }
            Err(e) => {
                warn!("Unparseable frame header: {}", e);
                RxPoll::Dropped(DropReason::UnsupportedType(self.buf[2]))
            }
        }
    }

    fn hunt(&mut self) {
        self.state = RxState::FrameStart;
        self.offset = 0;
        self.remaining = 1;
    }

    fn expect_header(&mut self) {
        self.state = RxState::HeaderRead;
        self.offset = 1;
        self.remaining = HEADER_LEN;
    }

    /// Information field of the last completed frame
    pub(crate) fn payload(&self) -> &[u8] {
        let len = usize::from(self.buf[INFO_START - 1] >> 1);
        &self.buf[INFO_START..INFO_START + len]
    }

    /// Hold the current payload for `dlci` and stop reading
    pub(crate) fn suspend(&mut self, dlci: Dlci) {
        self.state = RxState::Suspend;
        self.held = Some(Held { dlci, consumed: 0 });
    }

    /// Release the held payload and wait for the next header
    pub(crate) fn resume(&mut self) {
        self.held = None;
        self.expect_header();
    }

    pub(crate) fn held_for(&self, dlci: Dlci) -> bool {
        matches!(self.held, Some(held) if held.dlci == dlci)
    }

    /// Unread bytes of the held payload
    pub(crate) fn held_remaining(&self) -> usize {
        match self.held {
            Some(held) => self.payload().len() - held.consumed,
            None => 0,
        }
    }

    /// Copy held payload for `dlci` into `out`; `None` if nothing is held for it
    pub(crate) fn read_held(&mut self, dlci: Dlci, out: &mut [u8]) -> Option<usize> {
        let held = self.held.filter(|held| held.dlci == dlci)?;
        let available = &self.payload()[held.consumed..];
        let n = out.len().min(available.len());
        out[..n].copy_from_slice(&available[..n]);
        self.held = Some(Held {
            dlci,
            consumed: held.consumed + n,
        });
        Some(n)
    }
}

fn read_some(transport: &mut dyn Transport, buf: &mut [u8]) -> Option<usize> {
    loop {
        match transport.read(buf) {
            Ok(0) => return None,
            Ok(n) => return Some(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
            Err(e) => {
                warn!("Transport read failed: {}", e);
                return None;
            }
        }
    }
}
