//! APDU command definitions
//!
//! This module provides the command APDU type and its wire codec according to
//! ISO/IEC 7816-4 §5.1. Both the short and the extended length forms are
//! supported:
//!
//! ```text
//! Case 1   CLA INS P1 P2
//! Case 2S  CLA INS P1 P2 Le
//! Case 2E  CLA INS P1 P2 00 Le1 Le2
//! Case 3S  CLA INS P1 P2 Lc DATA
//! Case 3E  CLA INS P1 P2 00 Lc1 Lc2 DATA
//! Case 4S  CLA INS P1 P2 Lc DATA Le
//! Case 4E  CLA INS P1 P2 00 Lc1 Lc2 DATA Le1 Le2
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::{Error, Result};

/// Expected length type for APDU commands (1..=65536)
pub type ExpectedLength = u32;

/// Largest expected length expressible in a short Le field
pub const MAX_SHORT_LE: ExpectedLength = 256;

/// Largest expected length expressible in an extended Le field
pub const MAX_EXTENDED_LE: ExpectedLength = 65536;

/// Largest data field expressible in a short Lc field
pub const MAX_SHORT_LC: usize = 255;

/// Largest data field expressible in an extended Lc field
pub const MAX_EXTENDED_LC: usize = 65535;

/// ISO/IEC 7816-3 command case, determined by the presence and size of Lc/Le
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApduCase {
    /// Header only
    Case1,
    /// Short Le only
    Case2Short,
    /// Extended Le only
    Case2Extended,
    /// Short Lc and data
    Case3Short,
    /// Extended Lc and data
    Case3Extended,
    /// Short Lc, data and short Le
    Case4Short,
    /// Extended Lc, data and extended Le
    Case4Extended,
}

impl ApduCase {
    /// Whether this case uses the extended length encoding
    pub const fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::Case2Extended | Self::Case3Extended | Self::Case4Extended
        )
    }
}

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected length (optional)
    pub le: Option<ExpectedLength>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with expected response length (Le)
    pub const fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: ExpectedLength) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: Some(le),
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data)
    }

    /// Create a new command with both data and expected length
    pub fn new_with_data_and_le<T: Into<Bytes>>(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        data: T,
        le: ExpectedLength,
    ) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data).with_le(le)
    }

    /// Build a command from a 4 byte header
    pub const fn from_header(header: [u8; 4]) -> Self {
        Self::new(header[0], header[1], header[2], header[3])
    }

    /// Set the data field, an empty payload clears it
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        let data = data.into();
        self.data = (!data.is_empty()).then_some(data);
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: ExpectedLength) -> Self {
        self.le = Some(le);
        self
    }

    /// Header bytes (CLA, INS, P1, P2)
    pub const fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Length of the data field (Nc)
    pub fn lc(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }

    /// Whether Lc and/or Le need the extended form
    fn uses_extended_length(&self) -> bool {
        let lc = self.lc();
        let le = self.le.unwrap_or(0);
        lc > MAX_SHORT_LC || le > MAX_SHORT_LE
    }

    /// The command case selected by the encoder
    pub fn case(&self) -> ApduCase {
        let extended = self.uses_extended_length();
        match (self.lc() > 0, self.le.is_some(), extended) {
            (false, false, _) => ApduCase::Case1,
            (false, true, false) => ApduCase::Case2Short,
            (false, true, true) => ApduCase::Case2Extended,
            (true, false, false) => ApduCase::Case3Short,
            (true, false, true) => ApduCase::Case3Extended,
            (true, true, false) => ApduCase::Case4Short,
            (true, true, true) => ApduCase::Case4Extended,
        }
    }

    fn validate(&self) -> Result<()> {
        let lc = self.lc();
        if lc > MAX_EXTENDED_LC {
            return Err(Error::InvalidCommandLength(lc));
        }
        if let Some(le) = self.le {
            if le == 0 || le > MAX_EXTENDED_LE {
                return Err(Error::InvalidCommandLength(le as usize));
            }
        }
        Ok(())
    }

    /// Calculate length of serialized command
    pub fn command_length(&self) -> usize {
        let lc = self.lc();
        let extended = self.uses_extended_length();
        let lc_len = match (lc, extended) {
            (0, _) => 0,
            (_, false) => 1,
            (_, true) => 3,
        };
        let le_len = match (self.le, extended) {
            (None, _) => 0,
            (Some(_), false) => 1,
            (Some(_), true) if lc > 0 => 2,
            (Some(_), true) => 3,
        };
        4 + lc_len + lc + le_len
    }

    /// Convert to raw APDU bytes, picking the minimal encoding
    pub fn to_bytes(&self) -> Result<Bytes> {
        self.validate()?;

        let lc = self.lc();
        let extended = self.uses_extended_length();
        let mut buffer = BytesMut::with_capacity(self.command_length());

        // Header: CLA, INS, P1, P2
        buffer.put_slice(&self.header());

        if let Some(data) = &self.data {
            if extended {
                buffer.put_u8(0x00);
                buffer.put_u16(lc as u16);
            } else {
                buffer.put_u8(lc as u8);
            }
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            if extended {
                // Without an Lc field the extended Le needs its own 00 marker
                if lc == 0 {
                    buffer.put_u8(0x00);
                }
                buffer.put_u16(if le == MAX_EXTENDED_LE { 0 } else { le as u16 });
            } else {
                buffer.put_u8(if le == MAX_SHORT_LE { 0 } else { le as u8 });
            }
        }

        Ok(buffer.freeze())
    }

    /// Parse a command from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::InvalidCommandLength(data.len()));
        }

        let mut command = Self::new(data[0], data[1], data[2], data[3]);
        let body = &data[4..];

        match body {
            [] => {}
            [le] => command.le = Some(short_le(*le)),
            [0x00, hi, lo] => command.le = Some(extended_le(*hi, *lo)),
            [0x00, hi, lo, rest @ ..] => {
                let lc = u16::from_be_bytes([*hi, *lo]) as usize;
                if lc == 0 || rest.len() < lc {
                    return Err(Error::malformed("extended Lc does not match the body"));
                }
                let (payload, tail) = rest.split_at(lc);
                command.data = Some(Bytes::copy_from_slice(payload));
                command.le = match tail {
                    [] => None,
                    [le] => Some(short_le(*le)),
                    [hi, lo] => Some(extended_le(*hi, *lo)),
                    [0x00, hi, lo] => Some(extended_le(*hi, *lo)),
                    _ => return Err(Error::malformed("invalid Le after extended data")),
                };
            }
            [0x00, ..] => return Err(Error::malformed("truncated extended length field")),
            [lc, rest @ ..] => {
                let lc = *lc as usize;
                if rest.len() < lc {
                    return Err(Error::malformed("short Lc exceeds the body"));
                }
                let (payload, tail) = rest.split_at(lc);
                command.data = Some(Bytes::copy_from_slice(payload));
                command.le = match tail {
                    [] => None,
                    [le] => Some(short_le(*le)),
                    [0x00, hi, lo] => Some(extended_le(*hi, *lo)),
                    _ => return Err(Error::malformed("invalid Le after short data")),
                };
            }
        }

        trace!(
            cla = format_args!("{:#04x}", command.cla),
            ins = format_args!("{:#04x}", command.ins),
            lc = command.lc(),
            le = ?command.le,
            "Parsed APDU command"
        );

        Ok(command)
    }
}

const fn short_le(byte: u8) -> ExpectedLength {
    if byte == 0 {
        MAX_SHORT_LE
    } else {
        byte as ExpectedLength
    }
}

const fn extended_le(hi: u8, lo: u8) -> ExpectedLength {
    let le = ((hi as ExpectedLength) << 8) | lo as ExpectedLength;
    if le == 0 { MAX_EXTENDED_LE } else { le }
}

impl TryFrom<&[u8]> for Command {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        Self::from_bytes(data)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} {:02X} {:02X} {:02X}",
            self.cla, self.ins, self.p1, self.p2
        )?;
        if let Some(data) = &self.data {
            write!(f, " [{}]", hex::encode_upper(data))?;
        }
        if let Some(le) = self.le {
            write!(f, " Le={le}")?;
        }
        Ok(())
    }
}
