//! Unified event stream for the multiplexer
//!
//! Frame traffic, drops and channel lifecycle are published on a single
//! broadcast channel so a traffic monitor can observe the engine without
//! touching its state.

use cmux_protocol::{Dlci, FrameKind};

use crate::state::{EstablishStatus, EstablishTarget};

/// Why an incoming frame (or a response to it) was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Header checksum mismatch
    BadFcs,
    /// Trailing byte was not a flag
    MissingClosingFlag,
    /// Control byte matched no known frame type
    UnsupportedType(u8),
    /// UIH for a DLCI that is not established
    UnknownChannel(Dlci),
    /// A DM response was due but TX held another frame
    TxBusy,
}

/// Unified event enum for all multiplexer activity
#[derive(Debug, Clone)]
pub enum MuxEvent {
    // -------------------------------------------------------------------------
    // Traffic events
    // -------------------------------------------------------------------------
    /// A frame was fully written to the transport
    FrameSent {
        /// Frame type
        kind: FrameKind,
        /// Addressed DLCI
        dlci: Dlci,
        /// Encoded length in bytes
        len: usize,
    },

    /// A valid frame was received
    FrameReceived {
        /// Frame type
        kind: FrameKind,
        /// Addressed DLCI
        dlci: Dlci,
        /// Information field length
        len: usize,
    },

    /// A frame was discarded
    FrameDropped {
        /// Why it was discarded
        reason: DropReason,
    },

    /// Payload is waiting in the RX buffer for a channel
    DataReady {
        /// Owning DLCI
        dlci: Dlci,
        /// Payload length
        len: usize,
    },

    // -------------------------------------------------------------------------
    // Establishment events
    // -------------------------------------------------------------------------
    /// A SABM was resent after T1 expired
    Retransmit {
        /// Addressed DLCI
        dlci: Dlci,
        /// Resends still allowed after this one
        remaining: u8,
    },

    /// The control channel is open
    MuxOpened,

    /// A user channel is open
    ChannelOpened {
        /// The new DLCI
        dlci: Dlci,
    },

    /// An establishment ended without success
    EstablishFailed {
        /// What was being opened
        target: EstablishTarget,
        /// Reject or timeout
        status: EstablishStatus,
    },
}
