//! Password attributes and PIN block encoding

use derive_more::Display;
use tracing::warn;
use zeroize::Zeroizing;

use crate::{IfdError, Result};

/// Encoding of a password on the card
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PasswordType {
    /// ASCII digits
    #[display("ASCII_NUMERIC")]
    AsciiNumeric,
    /// UTF-8 text
    #[display("UTF_8")]
    Utf8,
    /// Packed BCD digits
    #[display("BCD")]
    Bcd,
    /// ISO 9564-1 format 2 PIN block
    #[display("ISO_9564_1")]
    Iso9564_1,
    /// One digit per byte, high nibble set
    #[display("HALF_NIBBLE_BCD")]
    HalfNibbleBcd,
}

/// Attributes describing how a PIN is encoded and stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordAttributes {
    /// Encoding of the password
    pub pwd_type: PasswordType,
    /// Minimum number of characters
    pub min_length: usize,
    /// Bytes the password occupies on the card
    pub stored_length: usize,
    /// Maximum number of characters, if limited
    pub max_length: Option<usize>,
    /// Pad byte used for the unused part of the stored length
    pub pad_char: Option<u8>,
    /// The `needs-padding` flag
    pub needs_padding: bool,
}

impl PasswordAttributes {
    /// Attributes without padding or length limit
    pub const fn new(pwd_type: PasswordType, min_length: usize, stored_length: usize) -> Self {
        Self {
            pwd_type,
            min_length,
            stored_length,
            max_length: None,
            pad_char: None,
            needs_padding: false,
        }
    }

    /// Set the maximum length
    pub const fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Set the pad byte
    pub const fn with_pad_char(mut self, pad_char: u8) -> Self {
        self.pad_char = Some(pad_char);
        self
    }

    /// Set the `needs-padding` flag
    pub const fn with_padding(mut self, needs_padding: bool) -> Self {
        self.needs_padding = needs_padding;
        self
    }

    /// ISO 9564-1 blocks are always padded
    pub const fn requires_padding(&self) -> bool {
        matches!(self.pwd_type, PasswordType::Iso9564_1) || self.needs_padding
    }

    fn effective_pad_char(&self) -> Result<u8> {
        if matches!(self.pwd_type, PasswordType::Iso9564_1) {
            return Ok(0xFF);
        }
        match self.pad_char {
            Some(c) => Ok(c),
            None if self.requires_padding() => Err(IfdError::parameter(
                "Unsupported combination of PIN parameters concerning padding.",
            )),
            // not used without padding
            None => Ok(0x00),
        }
    }

    /// Maximum length the reader should accept, derived from the stored
    /// length when no limit is given
    pub const fn reader_max_length(&self) -> usize {
        match (self.max_length, self.pwd_type) {
            (Some(max), _) => max,
            (None, PasswordType::Iso9564_1) => (self.stored_length * 2).saturating_sub(2),
            (None, PasswordType::Bcd) => self.stored_length * 2,
            (None, _) => self.stored_length,
        }
    }

    /// Encode a PIN as it is placed into the verify command
    pub fn encode(&self, pin: &str) -> Result<Zeroizing<Vec<u8>>> {
        let pad = self.effective_pad_char()?;
        match self.pwd_type {
            PasswordType::AsciiNumeric | PasswordType::Utf8 => self.encode_text(pin, pad),
            PasswordType::Bcd | PasswordType::Iso9564_1 | PasswordType::HalfNibbleBcd => {
                self.encode_bcd(pin, pad)
            }
        }
    }

    /// Pad mask placed into a reader PIN structure. Empty without padding.
    pub fn mask(&self) -> Result<Vec<u8>> {
        if !self.requires_padding() {
            return Ok(Vec::new());
        }
        let mut pad = self.effective_pad_char()?;
        if self.stored_length == 0 {
            return Err(IfdError::parameter(
                "PIN mask can only be created when storage size is known.",
            ));
        }
        if matches!(self.pwd_type, PasswordType::HalfNibbleBcd) {
            pad |= 0xF0;
        }
        let mut mask = vec![pad; self.stored_length];
        if matches!(self.pwd_type, PasswordType::Iso9564_1) {
            mask[0] = 0x20;
        }
        Ok(mask)
    }

    fn encode_text(&self, pin: &str, pad: u8) -> Result<Zeroizing<Vec<u8>>> {
        let padded = self.requires_padding();
        if padded && self.stored_length == 0 {
            return Err(IfdError::parameter(
                "Padding is required, but no stored length is given.",
            ));
        }
        if matches!(self.pwd_type, PasswordType::AsciiNumeric) && !pin.is_ascii() {
            return Err(IfdError::parameter("Entered PIN contains invalid characters."));
        }
        let chars = pin.chars().count();
        if chars < self.min_length {
            return Err(IfdError::parameter(format!(
                "Entered PIN is too short, enter at least {} characters.",
                self.min_length
            )));
        }
        if let Some(max) = self.max_length.filter(|max| *max > 0 && chars > *max) {
            return Err(IfdError::parameter(format!(
                "Entered PIN is too long, enter at most {max} characters."
            )));
        }

        let mut out = Zeroizing::new(pin.as_bytes().to_vec());
        if self.stored_length > 0 && out.len() > self.stored_length {
            return Err(IfdError::parameter(format!(
                "Storage size for PIN exceeded, only {} bytes are allowed.",
                self.stored_length
            )));
        }
        if padded && out.len() < self.stored_length {
            out.resize(self.stored_length, pad);
        }
        Ok(out)
    }

    fn encode_bcd(&self, pin: &str, pad: u8) -> Result<Zeroizing<Vec<u8>>> {
        let digits = Zeroizing::new(
            pin.chars()
                .map(|c| c.to_digit(10).map(|d| d as u8))
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| {
                    warn!("PIN with non digit characters rejected");
                    IfdError::parameter("Entered PIN contains invalid characters.")
                })?,
        );

        let mut out = Zeroizing::new(Vec::with_capacity(self.stored_length.max(digits.len())));
        match self.pwd_type {
            PasswordType::HalfNibbleBcd => out.extend(digits.iter().map(|d| 0xF0 | d)),
            _ => {
                if matches!(self.pwd_type, PasswordType::Iso9564_1) {
                    out.push(0x20 | (0x0F & digits.len() as u8));
                }
                for pair in digits.chunks(2) {
                    let low = pair.get(1).copied().unwrap_or(pad & 0x0F);
                    out.push((pair[0] << 4) | low);
                }
            }
        }

        if self.requires_padding() && out.len() < self.stored_length {
            out.resize(self.stored_length, pad);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_9564_1() {
        let attrs = PasswordAttributes::new(PasswordType::Iso9564_1, 4, 8)
            .with_max_length(12)
            .with_padding(true);
        assert_eq!(
            attrs.mask().unwrap(),
            vec![0x20, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            attrs.encode("123456789").unwrap().as_slice(),
            &[0x29, 0x12, 0x34, 0x56, 0x78, 0x9F, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_bcd() {
        let attrs = PasswordAttributes::new(PasswordType::Bcd, 4, 3)
            .with_max_length(6)
            .with_padding(true)
            .with_pad_char(0xFF);
        assert_eq!(attrs.mask().unwrap(), vec![0xFF, 0xFF, 0xFF]);
        assert_eq!(attrs.encode("12345").unwrap().as_slice(), &[0x12, 0x34, 0x5F]);
        assert!(attrs.encode("12a4").is_err());
    }

    #[test]
    fn test_ascii() {
        let attrs = PasswordAttributes::new(PasswordType::AsciiNumeric, 6, 6);
        assert_eq!(attrs.encode("123456").unwrap().as_slice(), b"123456");
        assert!(attrs.mask().unwrap().is_empty());
        assert!(attrs.encode("12345").is_err());
        assert!(attrs.encode("1234567").is_err());

        // padding without a pad char
        let attrs = attrs.with_padding(true);
        assert!(attrs.encode("123456").is_err());
    }

    #[test]
    fn test_half_nibble() {
        let attrs = PasswordAttributes::new(PasswordType::HalfNibbleBcd, 6, 6);
        assert_eq!(
            attrs.encode("123456").unwrap().as_slice(),
            &[0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6]
        );

        let attrs = PasswordAttributes::new(PasswordType::HalfNibbleBcd, 6, 7)
            .with_padding(true)
            .with_pad_char(0xFF);
        assert_eq!(
            attrs.encode("123456").unwrap().as_slice(),
            &[0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xFF]
        );
    }

    #[test]
    fn test_reader_max_length() {
        let iso = PasswordAttributes::new(PasswordType::Iso9564_1, 4, 8);
        assert_eq!(iso.reader_max_length(), 14);
        let bcd = PasswordAttributes::new(PasswordType::Bcd, 4, 3);
        assert_eq!(bcd.reader_max_length(), 6);
        let utf = PasswordAttributes::new(PasswordType::Utf8, 4, 5).with_max_length(9);
        assert_eq!(utf.reader_max_length(), 9);
    }
}
