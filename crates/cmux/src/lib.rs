//! cmux Multiplexer Engine
//!
//! This crate runs the initiator side of a GSM 07.10 basic-mode multiplexer:
//! it opens the control channel and user channels (DLCIs) over one serial
//! line and moves UIH data between those channels and the line.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ sigio ┌────────────┐ dispatch ┌─────────────────────────┐
//! │ Transport  │──────▶│ EventQueue │─────────▶│ MuxCore                 │
//! │ (serial)   │◀──────┴────────────┘          │  RX: flag/header/trailer│
//! └────────────┘   read / write                │  TX: one frame buffer   │
//!                                              │  registry of channels   │
//!                     ┌──────────────┐         └───────────┬─────────────┘
//!                     │ DataChannel  │◀── callback(ChannelIo) ┘
//!                     └──────────────┘
//! ```
//!
//! All engine state sits behind one mutex. The transport's readiness callback
//! only posts a dispatch task; reading, frame handling and writing happen on
//! the event queue. Channel callbacks run inside that dispatch with the lock
//! held and get a [`ChannelIo`] for I/O.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cmux::{EstablishStatus, Mux, MuxConfig, SerialTransport, TokioEventQueue};
//!
//! # fn main() -> anyhow::Result<()> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let mux = Mux::new(MuxConfig::default())?;
//! mux.eventqueue_attach(Arc::new(TokioEventQueue::new(runtime.handle().clone())))?;
//! mux.serial_attach(SerialTransport::open("/dev/ttyUSB0", 115_200)?)?;
//!
//! if mux.mux_start()? == EstablishStatus::Success {
//!     let channel = mux.dlci_establish(1)?.channel.unwrap();
//!     channel.write(b"AT\r");
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod mux;
pub mod queue;
pub mod state;
pub mod transport;

mod engine;
mod registry;
mod rx;
mod tx;

pub use channel::{ChannelIo, DataChannel};
pub use cmux_protocol::{Dlci, FrameKind};
pub use config::{MuxConfig, MAX_CHANNEL_SLOTS};
pub use error::MuxError;
pub use events::{DropReason, MuxEvent};
pub use mux::{Mux, PendingEstablish};
pub use queue::{EventId, EventQueue, Task, TokioEventQueue};
pub use registry::ChannelCallback;
pub use state::{EstablishStatus, EstablishTarget, Establishment, MuxStats};
pub use transport::{SerialTransport, SigioCallback, Transport};
