//! Status word definitions for APDU responses
//!
//! Trailer classification and texts follow ISO/IEC 7816-4 §5.1.3.

use std::fmt;

use tracing::Level;

/// Coarse classification of a trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// Process completed (90 00)
    Normal,
    /// Process completed with warning (62 XX, 63 XX)
    Warning,
    /// Process aborted, execution error (64 XX to 66 XX)
    ExecutionError,
    /// Process aborted, checking error (67 XX to 6F XX)
    CheckingError,
    /// Anything not covered above, including 61 XX
    Unknown,
}

/// Status Word (SW1-SW2) from an APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Create from a u16 value (SW1 | SW2)
    pub const fn from_u16(status: u16) -> Self {
        Self {
            sw1: (status >> 8) as u8,
            sw2: status as u8,
        }
    }

    /// Convert to a u16 value (SW1 | SW2)
    pub const fn to_u16(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Trailer as two raw bytes
    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    /// Check if this status word indicates success (90 00)
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Check if this status word indicates more data is available (61 XX)
    pub const fn is_more_data_available(&self) -> bool {
        self.sw1 == 0x61
    }

    /// Get the number of remaining bytes when SW1 = 61
    pub const fn remaining_bytes(&self) -> Option<u8> {
        if self.sw1 == 0x61 {
            Some(self.sw2)
        } else {
            None
        }
    }

    /// Retry counter carried by a 63 CX trailer
    pub const fn retry_counter(&self) -> Option<u8> {
        if self.sw1 == 0x63 && (self.sw2 & 0xF0) == 0xC0 {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }

    /// Check if this status word indicates a warning (62 XX or 63 XX)
    pub const fn is_warning(&self) -> bool {
        self.sw1 == 0x62 || self.sw1 == 0x63
    }

    /// Check if this status word indicates wrong length (67 00)
    pub const fn is_wrong_length(&self) -> bool {
        self.sw1 == 0x67 && self.sw2 == 0x00
    }

    /// Classify the trailer. Total over all 65536 values.
    pub const fn classify(&self) -> StatusClass {
        match self.sw1 {
            0x90 if self.sw2 == 0x00 => StatusClass::Normal,
            0x62 | 0x63 => StatusClass::Warning,
            0x64..=0x66 => StatusClass::ExecutionError,
            0x67..=0x6F => StatusClass::CheckingError,
            _ => StatusClass::Unknown,
        }
    }

    /// Whether this trailer matches one acceptable code.
    ///
    /// Two byte codes match exactly, a single byte code matches every trailer
    /// starting with that byte.
    pub fn matches_code(&self, code: &[u8]) -> bool {
        match code {
            [sw1] => self.sw1 == *sw1,
            [sw1, sw2] => self.sw1 == *sw1 && self.sw2 == *sw2,
            _ => false,
        }
    }

    /// Exact membership test against a list of acceptable codes
    pub fn is_positive_response<A: AsRef<[u8]>>(&self, acceptable: &[A]) -> bool {
        acceptable.iter().any(|code| self.matches_code(code.as_ref()))
    }

    /// Get the appropriate tracing level for this status word
    pub const fn tracing_level(&self) -> Level {
        match self.classify() {
            StatusClass::Normal => Level::DEBUG,
            StatusClass::Warning => Level::INFO,
            _ if self.is_more_data_available() => Level::DEBUG,
            _ => Level::WARN,
        }
    }

    /// Get a fixed description of this status word
    pub const fn description(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "No further qualification",
            (0x61, _) => "SW2 encodes the number of data bytes still available",
            (0x62, 0x00) => "No information given (NV-Ram not changed)",
            (0x62, 0x02..=0x80) => "Triggering by the card",
            (0x62, 0x81) => "Part of returned data may be corrupted",
            (0x62, 0x82) => "End of file or record reached before reading Ne bytes",
            (0x62, 0x83) => "Selected file deactivated",
            (0x62, 0x84) => "File control information not formatted according to 5.3.3",
            (0x62, 0x85) => "Selected file in termination state",
            (0x62, 0x86) => "No input data available from a sensor on the card",
            (0x63, 0x00) => "No information given (NV-Ram changed)",
            (0x63, 0x81) => "File filled up by the last write",
            (0x63, n) if (n & 0xF0) == 0xC0 => "Counter provided by 'X'",
            (0x64, 0x00) => "Execution error (NV-Ram not changed)",
            (0x64, 0x01) => "Immediate response required by the card",
            (0x64, 0x02..=0x80) => "Triggering by the card",
            (0x65, 0x00) => "No information given (NV-Ram changed)",
            (0x65, 0x81) => "Memory failure",
            (0x66, 0x00) => "Security-related issues",
            (0x67, 0x00) => "Wrong length; no further indication",
            (0x68, 0x00) => "Functions in CLA not supported",
            (0x68, 0x81) => "Logical channel not supported",
            (0x68, 0x82) => "Secure messaging not supported",
            (0x68, 0x83) => "Last command of the chain expected",
            (0x68, 0x84) => "Command chaining not supported",
            (0x69, 0x00) => "Command not allowed",
            (0x69, 0x81) => "Command incompatible with file structure",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x83) => "Authentication method blocked",
            (0x69, 0x84) => "Reference data not usable",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x69, 0x86) => "Command not allowed (no current EF)",
            (0x69, 0x87) => "Expected secure messaging data objects missing",
            (0x69, 0x88) => "Incorrect secure messaging data objects",
            (0x6A, 0x00) => "Wrong parameters P1-P2",
            (0x6A, 0x80) => "Incorrect parameters in the command data field",
            (0x6A, 0x81) => "Function not supported",
            (0x6A, 0x82) => "File or application not found",
            (0x6A, 0x83) => "Record not found",
            (0x6A, 0x84) => "Not enough memory space in the file",
            (0x6A, 0x85) => "Nc inconsistent with TLV structure",
            (0x6A, 0x86) => "Incorrect parameters P1-P2",
            (0x6A, 0x87) => "Nc inconsistent with parameters P1-P2",
            (0x6A, 0x88) => "Referenced data or reference data not found",
            (0x6A, 0x89) => "File already exists",
            (0x6A, 0x8A) => "DF name already exists",
            (0x6B, 0x00) => "Wrong parameters P1-P2",
            (0x6C, _) => "Wrong Le field; SW2 encodes the exact number of available data bytes",
            (0x6D, 0x00) => "Instruction code not supported or invalid",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => "Unknown status word",
        }
    }

    /// Human readable message, including the counts embedded in 61 XX, 6C XX
    /// and 63 CX
    pub fn message(&self) -> String {
        match (self.sw1, self.sw2) {
            (0x61, n) => format!("{n} response bytes are still available"),
            (0x6C, n) => format!("Wrong Le field; {n} data bytes are available"),
            (0x63, n) if (n & 0xF0) == 0xC0 => format!("Counter value is {}", n & 0x0F),
            _ => self.description().to_owned(),
        }
    }
}

impl From<(u8, u8)> for StatusWord {
    fn from(tuple: (u8, u8)) -> Self {
        Self::new(tuple.0, tuple.1)
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// Common status words
pub mod common {
    use super::StatusWord;

    /// Success (90 00)
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);

    /// Verification timed out on the reader keypad (64 00)
    pub const INPUT_TIMEOUT: StatusWord = StatusWord::new(0x64, 0x00);

    /// Input cancelled on the reader keypad (64 01)
    pub const INPUT_CANCELLED: StatusWord = StatusWord::new(0x64, 0x01);

    /// New PIN entries do not match (64 02)
    pub const PIN_MISMATCH: StatusWord = StatusWord::new(0x64, 0x02);

    /// Entered PIN has a wrong length (64 03)
    pub const PIN_WRONG_LENGTH: StatusWord = StatusWord::new(0x64, 0x03);

    /// Wrong length (67 00)
    pub const WRONG_LENGTH: StatusWord = StatusWord::new(0x67, 0x00);

    /// Security condition not satisfied (69 82)
    pub const SECURITY_CONDITION_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);

    /// Authentication method blocked (69 83)
    pub const AUTHENTICATION_BLOCKED: StatusWord = StatusWord::new(0x69, 0x83);

    /// File not found (6A 82)
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);

    /// Invalid parameter for a reader command (6B 80)
    pub const INVALID_PARAMETER: StatusWord = StatusWord::new(0x6B, 0x80);

    /// Invalid instruction (6D 00)
    pub const INVALID_INSTRUCTION: StatusWord = StatusWord::new(0x6D, 0x00);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_word_from_to_u16() {
        let sw = StatusWord::from_u16(0x9000);
        assert_eq!(sw.sw1, 0x90);
        assert_eq!(sw.sw2, 0x00);
        assert_eq!(sw.to_u16(), 0x9000);
        assert_eq!(sw.to_string(), "9000");
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(StatusWord::from_u16(0x9000).classify(), StatusClass::Normal);
        assert_eq!(StatusWord::from_u16(0x6282).classify(), StatusClass::Warning);
        assert_eq!(StatusWord::from_u16(0x63C2).classify(), StatusClass::Warning);
        assert_eq!(
            StatusWord::from_u16(0x6400).classify(),
            StatusClass::ExecutionError
        );
        assert_eq!(
            StatusWord::from_u16(0x6A88).classify(),
            StatusClass::CheckingError
        );
        assert_eq!(
            StatusWord::from_u16(0x6F00).classify(),
            StatusClass::CheckingError
        );
        assert_eq!(StatusWord::from_u16(0x9001).classify(), StatusClass::Unknown);
        assert_eq!(StatusWord::from_u16(0x6110).classify(), StatusClass::Unknown);
    }

    #[test]
    fn test_classification_is_total() {
        for raw in 0..=u16::MAX {
            let sw = StatusWord::from_u16(raw);
            let expected = match sw.sw1 {
                0x90 if sw.sw2 == 0 => StatusClass::Normal,
                0x62 | 0x63 => StatusClass::Warning,
                0x64 | 0x65 | 0x66 => StatusClass::ExecutionError,
                sw1 if (0x67..=0x6F).contains(&sw1) => StatusClass::CheckingError,
                _ => StatusClass::Unknown,
            };
            assert_eq!(sw.classify(), expected, "{sw}");
            assert!(!sw.message().is_empty());
        }
    }

    #[test]
    fn test_messages_with_counts() {
        assert_eq!(
            StatusWord::new(0x61, 0x15).message(),
            "21 response bytes are still available"
        );
        assert_eq!(
            StatusWord::new(0x6C, 0x20).message(),
            "Wrong Le field; 32 data bytes are available"
        );
        assert_eq!(StatusWord::new(0x63, 0xC2).message(), "Counter value is 2");
        assert_eq!(StatusWord::new(0x63, 0xC2).retry_counter(), Some(2));
        assert_eq!(
            StatusWord::new(0x6A, 0x82).message(),
            "File or application not found"
        );
        assert_eq!(StatusWord::new(0x12, 0x34).message(), "Unknown status word");
    }

    #[test]
    fn test_positive_response() {
        let sw = StatusWord::new(0x63, 0xC1);
        assert!(sw.is_positive_response(&[[0x63u8, 0xC1]]));
        assert!(!sw.is_positive_response(&[[0x90u8, 0x00]]));
        assert!(sw.is_positive_response(&[&[0x90u8, 0x00][..], &[0x63][..]]));
        assert!(!sw.is_positive_response::<&[u8]>(&[]));
        assert!(!sw.matches_code(&[0x63, 0xC1, 0x00]));
    }

    #[test]
    fn test_tracing_level() {
        assert_eq!(common::SUCCESS.tracing_level(), Level::DEBUG);
        assert_eq!(StatusWord::new(0x61, 0x02).tracing_level(), Level::DEBUG);
        assert_eq!(StatusWord::new(0x63, 0xC0).tracing_level(), Level::INFO);
        assert_eq!(common::FILE_NOT_FOUND.tracing_level(), Level::WARN);
    }
}
