//! Multiplexer configuration

use std::time::Duration;

use cmux_protocol::{FRAME_OVERHEAD, MAX_FRAME_LEN, MAX_INFO_LEN};
use serde::{Deserialize, Serialize};

use crate::error::MuxError;

/// Upper bound on channel slots (one bit each in the pending-callback mask)
pub const MAX_CHANNEL_SLOTS: usize = 32;

/// Multiplexer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Time to wait for UA/DM before resending a SABM (ms)
    pub t1_timeout_ms: u64,
    /// SABM retransmissions after the first send
    pub retransmit_count: u8,
    /// Size of the single outgoing frame buffer
    pub tx_buffer_size: usize,
    /// Number of user channels that can be established
    pub channel_slots: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            t1_timeout_ms: 300,
            retransmit_count: 3,
            tx_buffer_size: 31,
            channel_slots: 4,
            event_capacity: 64,
        }
    }
}

impl MuxConfig {
    /// Retransmission timer period
    pub fn t1_timeout(&self) -> Duration {
        Duration::from_millis(self.t1_timeout_ms)
    }

    /// Largest payload a single `write` can carry
    pub fn mtu(&self) -> usize {
        self.tx_buffer_size
            .saturating_sub(FRAME_OVERHEAD)
            .min(MAX_INFO_LEN)
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.t1_timeout_ms == 0 {
            return Err(MuxError::InvalidConfig(
                "t1_timeout_ms must be non-zero".into(),
            ));
        }
        if !(FRAME_OVERHEAD + 1..=MAX_FRAME_LEN).contains(&self.tx_buffer_size) {
            return Err(MuxError::InvalidConfig(format!(
                "tx_buffer_size {} outside {}..={}",
                self.tx_buffer_size,
                FRAME_OVERHEAD + 1,
                MAX_FRAME_LEN
            )));
        }
        if !(1..=MAX_CHANNEL_SLOTS).contains(&self.channel_slots) {
            return Err(MuxError::InvalidConfig(format!(
                "channel_slots {} outside 1..={}",
                self.channel_slots, MAX_CHANNEL_SLOTS
            )));
        }
        if self.event_capacity == 0 {
            return Err(MuxError::InvalidConfig(
                "event_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
