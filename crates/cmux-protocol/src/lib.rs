//! cmux Protocol Library
//!
//! This crate provides encoding and decoding for the GSM 07.10 basic-mode
//! multiplexer framing used to carry several logical channels (DLCIs) over a
//! single serial line.
//!
//! - **Frame check sequence**: table-driven CRC-8 over the frame header
//! - **Frame fields**: address (DLCI, C/R), control (frame type, P/F), length
//! - **Frame kinds**: SABM, UA, DM, DISC and UIH
//! - **Streaming decoder**: [`FrameCodec`] reassembles frames from partial reads
//!
//! Only the single-octet length form is supported, so a frame carries at most
//! 127 bytes of information.
//!
//! # Example
//!
//! ```rust
//! use cmux_protocol::{Dlci, Frame, FrameCodec, FrameKind};
//!
//! let dlci = Dlci::new(5).unwrap();
//! let bytes = Frame::uih(dlci, b"hi").unwrap().encode();
//! assert_eq!(bytes, [0xF9, 0x17, 0xEF, 0x05, b'h', b'i', 0xBA, 0xF9]);
//!
//! let mut codec = FrameCodec::new();
//! codec.push_bytes(&bytes);
//! let frame = codec.next_frame().unwrap();
//! assert_eq!(frame.kind(), Ok(FrameKind::Uih));
//! assert_eq!(frame.information, b"hi");
//! ```

pub mod codec;
pub mod error;
pub mod fcs;
pub mod frame;

pub use codec::FrameCodec;
pub use error::FrameError;
pub use fcs::{fcs, verify_fcs};
pub use frame::{
    encode_length, write_control_frame, write_uih_frame, Address, Control, Dlci, Frame,
    FrameHeader, FrameKind, CONTROL_FRAME_LEN, CR_BIT, EA_BIT, FLAG, FRAME_OVERHEAD, HEADER_LEN,
    MAX_FRAME_LEN, MAX_INFO_LEN, PF_BIT, TRAILER_LEN,
};
