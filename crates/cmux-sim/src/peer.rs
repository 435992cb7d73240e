//! Scripted multiplexer responder
//!
//! [`SimPeer`] sits on the far end of a [`LineHandle`], decodes whatever the
//! engine writes and answers SABMs according to a per-DLCI policy.

use std::collections::HashMap;

use cmux_protocol::{Dlci, Frame, FrameCodec, FrameError, FrameKind};
use tracing::debug;

use crate::serial::LineHandle;

/// How the peer answers a SABM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPolicy {
    /// Answer UA
    Accept,
    /// Answer DM
    Reject,
    /// Never answer
    Ignore,
    /// Stay silent for the first `n` SABMs, then answer UA
    IgnoreFirst(usize),
}

/// Far end of a virtual line speaking the multiplexer protocol
pub struct SimPeer {
    line: LineHandle,
    codec: FrameCodec,
    default_policy: PeerPolicy,
    policies: HashMap<Dlci, PeerPolicy>,
    sabm_counts: HashMap<Dlci, usize>,
    received: Vec<Frame>,
}

impl SimPeer {
    /// Create a peer that accepts every SABM
    pub fn new(line: LineHandle) -> Self {
        Self {
            line,
            codec: FrameCodec::new(),
            default_policy: PeerPolicy::Accept,
            policies: HashMap::new(),
            sabm_counts: HashMap::new(),
            received: Vec::new(),
        }
    }

    /// Policy for DLCIs without their own
    pub fn set_default_policy(&mut self, policy: PeerPolicy) {
        self.default_policy = policy;
    }

    /// Policy for one DLCI
    pub fn set_policy(&mut self, dlci: Dlci, policy: PeerPolicy) {
        self.policies.insert(dlci, policy);
    }

    /// Decode everything the engine wrote and answer SABMs; returns frames decoded
    pub fn poll(&mut self) -> usize {
        self.codec.push_bytes(&self.line.take_output());
        let mut decoded = 0;
        while let Some(frame) = self.codec.next_frame() {
            decoded += 1;
            if frame.kind() == Ok(FrameKind::Sabm) {
                self.answer_sabm(frame.dlci());
            }
            self.received.push(frame);
        }
        decoded
    }

    fn answer_sabm(&mut self, dlci: Dlci) {
        let count = self.sabm_counts.entry(dlci).or_insert(0);
        *count += 1;
        let policy = self
            .policies
            .get(&dlci)
            .copied()
            .unwrap_or(self.default_policy);

        let reply = match policy {
            PeerPolicy::Accept => Some(Frame::ua(dlci)),
            PeerPolicy::Reject => Some(Frame::dm(dlci)),
            PeerPolicy::Ignore => None,
            PeerPolicy::IgnoreFirst(n) if *count > n => Some(Frame::ua(dlci)),
            PeerPolicy::IgnoreFirst(_) => None,
        };
        match reply {
            Some(frame) => {
                debug!("Peer answering SABM {} on DLCI {}", *count, dlci);
                self.send(&frame);
            }
            None => debug!("Peer ignoring SABM {} on DLCI {}", *count, dlci),
        }
    }

    /// Put a frame on the line
    pub fn send(&self, frame: &Frame) {
        self.line.inject(&frame.encode());
    }

    /// Send `data` on `dlci` as one UIH frame
    pub fn send_data(&self, dlci: Dlci, data: &[u8]) -> Result<(), FrameError> {
        self.send(&Frame::uih(dlci, data)?);
        Ok(())
    }

    /// Put raw bytes on the line
    pub fn send_raw(&self, bytes: &[u8]) {
        self.line.inject(bytes);
    }

    /// Every frame decoded so far
    pub fn received(&self) -> &[Frame] {
        &self.received
    }

    /// Drain the decoded frame log
    pub fn take_received(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.received)
    }

    /// Decoded frames of one kind
    pub fn count(&self, kind: FrameKind) -> usize {
        self.received
            .iter()
            .filter(|frame| frame.kind() == Ok(kind))
            .count()
    }

    /// SABMs seen for `dlci`
    pub fn sabm_count(&self, dlci: Dlci) -> usize {
        self.sabm_counts.get(&dlci).copied().unwrap_or(0)
    }

    /// UIH payloads received on `dlci`, in order
    pub fn payloads(&self, dlci: Dlci) -> Vec<Vec<u8>> {
        self.received
            .iter()
            .filter(|frame| frame.kind() == Ok(FrameKind::Uih) && frame.dlci() == dlci)
            .map(|frame| frame.information.clone())
            .collect()
    }

    /// The line this peer sits on
    pub fn line(&self) -> &LineHandle {
        &self.line
    }
}
