//! PC/SC `PIN_VERIFY_STRUCTURE` for `FEATURE_VERIFY_PIN_DIRECT`

use super::encoding::{PasswordAttributes, PasswordType};
use crate::{IfdError, Result};

/// Reader side PIN verification request (PC/SC Part 10, 2.5.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinVerifyStructure {
    /// Timeout in seconds, zero for the reader default
    pub timeout: u8,
    /// Timeout in seconds after the first key
    pub timeout2: u8,
    /// `bmFormatString`
    pub format_string: u8,
    /// `bmPINBlockString`
    pub pin_block_string: u8,
    /// `bmPINLengthFormat`
    pub pin_length_format: u8,
    /// Minimum PIN size in digits
    pub min_pin_size: u8,
    /// Maximum PIN size in digits
    pub max_pin_size: u8,
    /// USB language id of the prompt
    pub language_id: u16,
    /// APDU sent to the card, PIN positions masked
    pub data: Vec<u8>,
}

fn pin_size(size: usize) -> Result<u8> {
    u8::try_from(size).map_err(|_| IfdError::parameter("PIN length exceeds 255 digits."))
}

impl PinVerifyStructure {
    const ENTRY_VALIDATION: u8 = 0x02;
    const NUMBER_MESSAGE: u8 = 0x01;
    const MSG_INDEX: u8 = 0x00;

    /// Build the structure for a verify command template
    pub fn new(attributes: &PasswordAttributes, template: &[u8], language_id: u16) -> Result<Self> {
        let mask = attributes.mask()?;
        let mut data = template.to_vec();
        if !mask.is_empty() {
            let len = u8::try_from(mask.len())
                .map_err(|_| IfdError::parameter("PIN mask exceeds 255 bytes."))?;
            data.push(len);
            data.extend_from_slice(&mask);
        }

        let iso = matches!(attributes.pwd_type, PasswordType::Iso9564_1);
        let pin_type: u8 = match attributes.pwd_type {
            PasswordType::Bcd | PasswordType::Iso9564_1 => 1,
            PasswordType::AsciiNumeric | PasswordType::Utf8 => 2,
            PasswordType::HalfNibbleBcd => 0,
        };
        // system units are bytes, PIN left justified
        let format_string = 0x80 | (u8::from(iso) << 3) | pin_type;

        let length_bits: u8 = if iso { 4 } else { 0 };
        let block_size = if iso {
            attributes.stored_length.saturating_sub(1)
        } else {
            attributes.stored_length
        } as u8;
        let pin_block_string = (length_bits << 4) | (block_size & 0x0F);
        let pin_length_format = if iso { 4 } else { 0 };

        Ok(Self {
            timeout: 0x3C,
            timeout2: 0x00,
            format_string,
            pin_block_string,
            pin_length_format,
            min_pin_size: pin_size(attributes.min_length)?,
            max_pin_size: pin_size(attributes.reader_max_length())?,
            language_id,
            data,
        })
    }

    /// Serialize for the control command
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(19 + self.data.len());
        out.extend_from_slice(&[
            self.timeout,
            self.timeout2,
            self.format_string,
            self.pin_block_string,
            self.pin_length_format,
            self.max_pin_size,
            self.min_pin_size,
            Self::ENTRY_VALIDATION,
            Self::NUMBER_MESSAGE,
        ]);
        out.extend_from_slice(&self.language_id.to_le_bytes());
        out.push(Self::MSG_INDEX);
        // bTeoPrologue
        out.extend_from_slice(&[0x00, 0x00, 0x00]);
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}
