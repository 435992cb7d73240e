//! cmux Simulation Library
//!
//! This crate provides a simulation layer for testing the multiplexer without
//! serial hardware or a real runtime. It includes:
//!
//! - **VirtualSerial**: an in-memory line with a test-side [`LineHandle`]
//! - **ManualQueue**: an event queue driven by a virtual clock
//! - **SimPeer**: a far-end responder with per-DLCI SABM policies
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use cmux::{EstablishStatus, Mux, MuxConfig};
//! use cmux_sim::{ManualQueue, SimPeer, VirtualSerial};
//!
//! let queue = Arc::new(ManualQueue::new());
//! let (serial, line) = VirtualSerial::pair();
//! let mux = Mux::new(MuxConfig::default()).unwrap();
//! mux.eventqueue_attach(queue.clone()).unwrap();
//! mux.serial_attach(serial).unwrap();
//! let mut peer = SimPeer::new(line);
//!
//! let mut pending = mux.request_mux_start().unwrap();
//! peer.poll();
//! queue.run_pending();
//!
//! let result = pending.try_resolve().unwrap().unwrap();
//! assert_eq!(result.status, EstablishStatus::Success);
//! assert!(mux.is_open());
//! ```

pub mod peer;
pub mod queue;
pub mod serial;

pub use peer::{PeerPolicy, SimPeer};
pub use queue::ManualQueue;
pub use serial::{LineHandle, VirtualSerial};
