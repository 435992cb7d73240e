//! Establishment state and counters

use cmux_protocol::Dlci;
use serde::Serialize;

use crate::channel::DataChannel;

/// Outcome of a SABM handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EstablishStatus {
    /// Peer answered UA
    Success,
    /// Peer answered DM
    Reject,
    /// Retransmissions exhausted without an answer
    Timeout,
}

/// What an establishment is opening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishTarget {
    /// The multiplexer control channel (DLCI 0)
    Control,
    /// A user channel
    Channel(Dlci),
}

impl EstablishTarget {
    /// DLCI the SABM is addressed to
    pub fn dlci(&self) -> Dlci {
        match self {
            Self::Control => Dlci::CONTROL,
            Self::Channel(dlci) => *dlci,
        }
    }
}

/// Single-flight establishment tracking
///
/// `Pending` waits for the TX pipeline to go idle; `Running` has a SABM on the
/// wire or awaiting its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum EstablishPhase {
    #[default]
    Idle,
    Pending(EstablishTarget),
    Running(EstablishTarget),
}

/// Result of a resolved establishment
#[derive(Debug)]
pub struct Establishment {
    /// Protocol outcome
    pub status: EstablishStatus,
    /// Handle for the new channel (successful DLCI establishment only)
    pub channel: Option<DataChannel>,
}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MuxStats {
    /// Frames fully written to the transport
    pub frames_sent: u64,
    /// Valid frames received
    pub frames_received: u64,
    /// Frames discarded for any reason
    pub frames_dropped: u64,
    /// Frames discarded because of an FCS mismatch
    pub fcs_errors: u64,
    /// SABM resends after a T1 expiry
    pub retransmissions: u64,
    /// Establishments that ended in timeout
    pub timeouts: u64,
}
