//! Outgoing frame buffer and transmit state

use std::io;

use cmux_protocol::{
    write_control_frame, write_uih_frame, Address, Dlci, FrameKind, FRAME_OVERHEAD, MAX_INFO_LEN,
};
use tracing::warn;

use crate::queue::EventId;
use crate::transport::Transport;

/// Transmit pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    /// Buffer free
    Idle,
    /// SABM being written
    RetransmitEnqueue,
    /// SABM written, waiting for UA/DM or T1
    RetransmitDone,
    /// DM response being written
    InternalResp,
    /// User UIH being written
    NoRetransmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxPoll {
    /// Transport stopped accepting bytes
    Pending,
    /// Whole frame written
    Complete,
}

/// Channels whose writes were refused while TX was busy
///
/// One bit per registry slot. Served round-robin so a chatty channel cannot
/// starve the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PendingMask {
    bits: u32,
    last: Option<usize>,
}

impl PendingMask {
    pub(crate) fn set(&mut self, index: usize) {
        self.bits |= 1 << index;
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        self.bits & (1 << index) != 0
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Clear and return the next pending slot after the last one served
    pub(crate) fn take_next(&mut self, slots: usize) -> Option<usize> {
        if self.bits == 0 || slots == 0 {
            return None;
        }
        let start = self.last.map_or(0, |last| last + 1);
        let index = (0..slots)
            .map(|step| (start + step) % slots)
            .find(|&index| self.is_set(index))?;
        self.bits &= !(1 << index);
        self.last = Some(index);
        Some(index)
    }
}

/// The single outgoing frame plus its write progress
pub(crate) struct TxContext {
    buf: Vec<u8>,
    len: usize,
    offset: usize,
    pub(crate) state: TxState,
    pub(crate) retransmit_counter: u8,
    pub(crate) pending: PendingMask,
    pub(crate) timer: Option<EventId>,
    pub(crate) timer_generation: u64,
}

impl TxContext {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
            offset: 0,
            state: TxState::Idle,
            retransmit_counter: 0,
            pending: PendingMask::default(),
            timer: None,
            timer_generation: 0,
        }
    }

    /// Largest UIH payload the buffer can hold
    pub(crate) fn mtu(&self) -> usize {
        (self.buf.len() - FRAME_OVERHEAD).min(MAX_INFO_LEN)
    }

    /// Encode a SABM/DM/DISC/UA into the buffer
    pub(crate) fn load_control(&mut self, kind: FrameKind, dlci: Dlci) {
        let len = write_control_frame(&mut self.buf, kind, dlci)
            .unwrap_or_else(|e| panic!("cannot load {} into TX buffer: {}", kind, e));
        self.loaded(len);
    }

    /// Encode a UIH carrying as much of `data` as fits; returns the bytes taken
    pub(crate) fn load_uih(&mut self, dlci: Dlci, data: &[u8]) -> usize {
        let accepted = data.len().min(self.mtu());
        let len = write_uih_frame(&mut self.buf, dlci, &data[..accepted])
            .unwrap_or_else(|e| panic!("cannot load UIH into TX buffer: {}", e));
        self.loaded(len);
        accepted
    }

    fn loaded(&mut self, len: usize) {
        self.len = len;
        self.offset = 0;
    }

    /// Restart writing the loaded frame from its first byte
    pub(crate) fn rewind(&mut self) {
        self.offset = 0;
    }

    pub(crate) fn frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.len - self.offset
    }

    /// Frame type of the loaded frame
    pub(crate) fn kind(&self) -> Option<FrameKind> {
        FrameKind::try_from(self.buf[2]).ok()
    }

    /// DLCI the loaded frame is addressed to
    pub(crate) fn dlci(&self) -> Dlci {
        Address::from_byte(self.buf[1]).dlci()
    }

    /// Write until the frame is out or the transport refuses more
    ///
    /// Hard write errors are logged and treated like a full transport; the
    /// next readiness signal retries.
    pub(crate) fn flush(&mut self, transport: &mut dyn Transport) -> TxPoll {
        while self.offset < self.len {
            match transport.write(&self.buf[self.offset..self.len]) {
                Ok(0) => return TxPoll::Pending,
                Ok(n) => self.offset += n.min(self.len - self.offset),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TxPoll::Pending,
                Err(e) => {
                    warn!("Transport write failed: {}", e);
                    return TxPoll::Pending;
                }
            }
        }
        TxPoll::Complete
    }
}
