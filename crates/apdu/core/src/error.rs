//! Core error type for APDU encoding, decoding and template evaluation
//!
//! All codec failures are funnelled into [`Error`] so callers further up (the
//! IFD service in particular) only need to match a single type.

use crate::response::error::ResponseError;
use crate::template::TemplateError;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// Byte count does not match any of the seven command cases
    #[error("Malformed APDU: {0}")]
    MalformedApdu(&'static str),

    /// A length field value cannot be represented
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Response could not be parsed
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Template evaluation failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a new malformed APDU error
    pub const fn malformed(message: &'static str) -> Self {
        Self::MalformedApdu(message)
    }

    /// Whether this error (or the error it wraps) describes an unparseable APDU
    pub fn is_malformed(&self) -> bool {
        match self {
            Self::MalformedApdu(_) | Self::Response(ResponseError::Incomplete) => true,
            Self::Context { source, .. } => source.is_malformed(),
            _ => false,
        }
    }
}

/// Extension trait for Result with APDU Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<S: Into<String>>(self, context: S) -> Self {
        self.map_err(|e| e.with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_malformed_flag() {
        let err = Error::malformed("body too short").with_context("decoding SELECT");
        assert!(err.is_malformed());
        assert_eq!(
            err.to_string(),
            "decoding SELECT: Malformed APDU: body too short"
        );
    }

    #[test]
    fn test_incomplete_response_is_malformed() {
        let err: Error = ResponseError::Incomplete.into();
        assert!(err.is_malformed());
        assert!(!Error::InvalidCommandLength(70000).is_malformed());
    }
}
