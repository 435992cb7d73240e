//! Basic-mode frame layout
//!
//! # Frame Format
//! ```text
//! F9 [address] [control] [length] [information...] [fcs] F9
//! ```
//!
//! - `F9`: Flag sequence, opens and closes every frame
//! - `address`: `EA | C/R << 1 | DLCI << 2`
//! - `control`: Frame type, optionally OR'd with the P/F bit (`0x10`)
//! - `length`: `1 | len << 1`, single-octet form only
//! - `information`: Payload, UIH frames only
//! - `fcs`: Checksum over address, control and length

use std::fmt;

use crate::error::FrameError;
use crate::fcs::fcs;

/// Flag sequence octet
pub const FLAG: u8 = 0xF9;
/// Extension bit (address and length octets)
pub const EA_BIT: u8 = 0x01;
/// Command/response bit (address octet)
pub const CR_BIT: u8 = 0x02;
/// Poll/final bit (control octet)
pub const PF_BIT: u8 = 0x10;

/// Address, control and length octets
pub const HEADER_LEN: usize = 3;
/// FCS plus closing flag
pub const TRAILER_LEN: usize = 2;
/// Bytes every frame carries besides its information field
pub const FRAME_OVERHEAD: usize = 1 + HEADER_LEN + TRAILER_LEN;
/// Length of SABM, UA, DM and DISC frames
pub const CONTROL_FRAME_LEN: usize = FRAME_OVERHEAD;
/// Largest payload a single-octet length field can describe
pub const MAX_INFO_LEN: usize = 0x7F;
/// Largest frame with a single-octet length field
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_INFO_LEN;

/// Data Link Connection Identifier
///
/// DLCI 0 is the multiplexer control channel; 1..=63 are user channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct Dlci(u8);

impl Dlci {
    /// The multiplexer control channel
    pub const CONTROL: Dlci = Dlci(0);
    /// Highest DLCI representable in the address octet
    pub const MAX: u8 = 63;

    /// Create a DLCI, returning `None` if it does not fit in 6 bits
    pub const fn new(id: u8) -> Option<Self> {
        if id <= Self::MAX {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Create a user-channel DLCI (1..=63)
    pub fn user(id: u8) -> Result<Self, FrameError> {
        if (1..=Self::MAX).contains(&id) {
            Ok(Self(id))
        } else {
            Err(FrameError::InvalidDlci(id))
        }
    }

    /// Raw DLCI value
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Whether this is the control channel
    pub const fn is_control(self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<u8> for Dlci {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(FrameError::InvalidDlci(value))
    }
}

impl From<Dlci> for u8 {
    fn from(dlci: Dlci) -> u8 {
        dlci.0
    }
}

impl fmt::Display for Dlci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame types carried in the control octet (P/F bit clear)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameKind {
    /// Set Asynchronous Balanced Mode (connection request)
    Sabm = 0x2F,
    /// Unnumbered Acknowledgement
    Ua = 0x63,
    /// Disconnected Mode (rejection)
    Dm = 0x0F,
    /// Disconnect request
    Disc = 0x43,
    /// Unnumbered Information with Header check (user data)
    Uih = 0xEF,
}

impl FrameKind {
    /// Control octet code with the P/F bit clear
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sabm => "SABM",
            Self::Ua => "UA",
            Self::Dm => "DM",
            Self::Disc => "DISC",
            Self::Uih => "UIH",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    /// Classify a control octet, ignoring the P/F bit
    fn try_from(control: u8) -> Result<Self, Self::Error> {
        match control & !PF_BIT {
            0x2F => Ok(Self::Sabm),
            0x63 => Ok(Self::Ua),
            0x0F => Ok(Self::Dm),
            0x43 => Ok(Self::Disc),
            0xEF => Ok(Self::Uih),
            _ => Err(FrameError::UnsupportedFrameType(control)),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address(u8);

impl Address {
    /// Build an address for `dlci` with the EA bit set
    pub const fn new(dlci: Dlci, command: bool) -> Self {
        let cr = if command { CR_BIT } else { 0 };
        Self(EA_BIT | cr | (dlci.get() << 2))
    }

    /// Wrap a raw address octet
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw octet
    pub const fn byte(self) -> u8 {
        self.0
    }

    /// DLCI carried in bits 2..=7
    pub const fn dlci(self) -> Dlci {
        Dlci(self.0 >> 2)
    }

    /// C/R bit
    pub const fn is_command(self) -> bool {
        self.0 & CR_BIT != 0
    }
}

/// Control octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control(u8);

impl Control {
    /// Build a control octet for `kind`
    pub const fn new(kind: FrameKind, poll_final: bool) -> Self {
        let pf = if poll_final { PF_BIT } else { 0 };
        Self(kind.code() | pf)
    }

    /// Wrap a raw control octet
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw octet
    pub const fn byte(self) -> u8 {
        self.0
    }

    /// Frame type with the P/F bit masked out
    pub fn kind(self) -> Result<FrameKind, FrameError> {
        FrameKind::try_from(self.0)
    }

    /// P/F bit
    pub const fn is_poll_final(self) -> bool {
        self.0 & PF_BIT != 0
    }
}

/// Encode a payload length as a single length octet
pub fn encode_length(len: usize) -> Result<u8, FrameError> {
    if len > MAX_INFO_LEN {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: MAX_INFO_LEN,
        });
    }
    Ok(EA_BIT | ((len as u8) << 1))
}

/// Parsed address, control and length octets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Address octet
    pub address: Address,
    /// Control octet
    pub control: Control,
    /// Frame type
    pub kind: FrameKind,
    /// Information field length in bytes
    pub length: usize,
}

impl FrameHeader {
    /// Parse the three header octets that follow the opening flag
    pub fn parse(header: &[u8]) -> Result<Self, FrameError> {
        let &[address, control, length] = header else {
            return Err(FrameError::InvalidFrame(format!(
                "header must be {} bytes, got {}",
                HEADER_LEN,
                header.len()
            )));
        };
        if length & EA_BIT == 0 {
            return Err(FrameError::MultiByteLength(length));
        }
        let control = Control::from_byte(control);
        Ok(Self {
            address: Address::from_byte(address),
            control,
            kind: control.kind()?,
            length: usize::from(length >> 1),
        })
    }

    /// DLCI the frame is addressed to
    pub fn dlci(&self) -> Dlci {
        self.address.dlci()
    }

    /// Both C/R and P/F set: a command expecting a reply, or the final reply to one
    pub fn is_command_final(&self) -> bool {
        self.address.is_command() && self.control.is_poll_final()
    }
}

fn write_frame(
    buf: &mut [u8],
    address: Address,
    control: Control,
    information: &[u8],
) -> Result<usize, FrameError> {
    let total = FRAME_OVERHEAD + information.len();
    let length = encode_length(information.len())?;
    if buf.len() < total {
        return Err(FrameError::BufferTooSmall {
            needed: total,
            available: buf.len(),
        });
    }

    buf[0] = FLAG;
    buf[1] = address.byte();
    buf[2] = control.byte();
    buf[3] = length;
    buf[4..4 + information.len()].copy_from_slice(information);
    buf[total - 2] = fcs(&buf[1..1 + HEADER_LEN]);
    buf[total - 1] = FLAG;
    Ok(total)
}

/// Write a SABM, UA, DM or DISC frame (C/R and P/F set) into `buf`
pub fn write_control_frame(
    buf: &mut [u8],
    kind: FrameKind,
    dlci: Dlci,
) -> Result<usize, FrameError> {
    if kind == FrameKind::Uih {
        return Err(FrameError::InvalidFrame("UIH is not a control frame".into()));
    }
    write_frame(buf, Address::new(dlci, true), Control::new(kind, true), &[])
}

/// Write a UIH frame carrying `payload` into `buf`
///
/// The FCS covers the header only; the payload is not checksummed.
pub fn write_uih_frame(buf: &mut [u8], dlci: Dlci, payload: &[u8]) -> Result<usize, FrameError> {
    write_frame(
        buf,
        Address::new(dlci, true),
        Control::new(FrameKind::Uih, false),
        payload,
    )
}

/// An owned frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Address octet
    pub address: Address,
    /// Control octet
    pub control: Control,
    /// Information field
    pub information: Vec<u8>,
}

impl Frame {
    /// Create a frame from raw parts
    pub fn new(address: Address, control: Control, information: Vec<u8>) -> Self {
        Self {
            address,
            control,
            information,
        }
    }

    fn command(kind: FrameKind, dlci: Dlci) -> Self {
        Self::new(Address::new(dlci, true), Control::new(kind, true), Vec::new())
    }

    /// SABM connection request
    pub fn sabm(dlci: Dlci) -> Self {
        Self::command(FrameKind::Sabm, dlci)
    }

    /// UA acknowledgement
    pub fn ua(dlci: Dlci) -> Self {
        Self::command(FrameKind::Ua, dlci)
    }

    /// DM rejection
    pub fn dm(dlci: Dlci) -> Self {
        Self::command(FrameKind::Dm, dlci)
    }

    /// DISC request
    pub fn disc(dlci: Dlci) -> Self {
        Self::command(FrameKind::Disc, dlci)
    }

    /// UIH data frame
    pub fn uih(dlci: Dlci, data: &[u8]) -> Result<Self, FrameError> {
        encode_length(data.len())?;
        Ok(Self::new(
            Address::new(dlci, true),
            Control::new(FrameKind::Uih, false),
            data.to_vec(),
        ))
    }

    /// Frame type
    pub fn kind(&self) -> Result<FrameKind, FrameError> {
        self.control.kind()
    }

    /// DLCI the frame is addressed to
    pub fn dlci(&self) -> Dlci {
        self.address.dlci()
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        FRAME_OVERHEAD + self.information.len()
    }

    /// Whether the information field is empty
    pub fn is_empty(&self) -> bool {
        self.information.is_empty()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        // Length was validated by the constructors; raw `new` callers get a truncated field
        let information = &self.information[..self.information.len().min(MAX_INFO_LEN)];
        let written = write_frame(&mut buf, self.address, self.control, information)
            .unwrap_or(FRAME_OVERHEAD);
        buf.truncate(written);
        buf
    }
}
