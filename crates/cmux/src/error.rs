//! Error types for the multiplexer

use cmux_protocol::Dlci;
use thiserror::Error;

/// Errors returned synchronously by the multiplexer API
///
/// Protocol outcomes of an establishment (success, rejection, timeout) are not
/// errors; they are reported as [`EstablishStatus`](crate::EstablishStatus).
#[derive(Debug, Error)]
pub enum MuxError {
    /// DLCI outside 1..=63
    #[error("DLCI {0} is outside the valid range 1..=63")]
    InvalidRange(u8),

    /// Control channel has not been opened yet
    #[error("multiplexer control channel is not open")]
    MuxNotOpen,

    /// Control channel is already open
    #[error("multiplexer control channel is already open")]
    AlreadyOpen,

    /// DLCI is already established
    #[error("DLCI {0} is already established")]
    DlciInUse(Dlci),

    /// Every channel slot is bound
    #[error("all {0} channel slots are in use")]
    RegistryFull(usize),

    /// Another establishment is pending or running
    #[error("an establishment request is already in progress")]
    InProgress,

    /// A collaborator has not been attached
    #[error("{0} not attached")]
    NotAttached(&'static str),

    /// A collaborator was attached twice
    #[error("{0} already attached")]
    AlreadyAttached(&'static str),

    /// The engine went away before answering
    #[error("engine stopped before the establishment resolved")]
    Abandoned,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MuxError {
    /// Whether the request was refused for lack of a free resource
    pub fn is_no_resource(&self) -> bool {
        matches!(
            self,
            Self::AlreadyOpen | Self::DlciInUse(_) | Self::RegistryFull(_)
        )
    }
}
