//! Error type of the IFD layer
//!
//! Every service operation fails with an [`IfdError`]. Provider errors are
//! converted at the service boundary and never returned raw.

use derive_more::Display;
use ecard_apdu_core::{ResponseError, TemplateError};

use crate::scio::{ScioError, ScioErrorCode};

/// Result alias used throughout the crate
pub type Result<T, E = IfdError> = std::result::Result<T, E>;

/// Coarse error taxonomy
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid context handle
    Context,
    /// Invalid or expired slot handle, or no card
    Slot,
    /// Malformed request fields
    Parameter,
    /// Unknown protocol or malformed protocol data
    Protocol,
    /// Provider failure not otherwise classified
    Device,
    /// Cancellation by the user or the caller
    Cancellation,
    /// Template evaluation failure
    Template,
    /// Codec parse failure
    MalformedApdu,
}

/// Errors returned by the IFD service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IfdError {
    /// Context handle does not match the active one
    #[error("Invalid context handle specified.")]
    InvalidContextHandle,

    /// Slot handle is unknown or no longer valid
    #[error("Invalid slot handle: {0}")]
    InvalidSlotHandle(String),

    /// Terminal name unknown to the provider
    #[error("Unknown IFD: {0}")]
    UnknownIfd(String),

    /// No card in the addressed terminal
    #[error("No card available: {0}")]
    NoCard(String),

    /// Request parameter rejected
    #[error("Incorrect parameter: {0}")]
    IncorrectParameter(String),

    /// Requested protocol is not available
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Protocol exchange failed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reader level failure
    #[error("Unknown IFD error: {0}")]
    UnknownIfdError(String),

    /// Failure without a better classification
    #[error("{0}")]
    Unknown(String),

    /// The user cancelled the operation
    #[error("Cancellation by user: {0}")]
    CancellationByUser(String),

    /// Nothing to cancel
    #[error("Cancel not possible: {0}")]
    CancelNotPossible(String),

    /// The operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// PIN verification failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Requested input unit is not available
    #[error("Unknown input unit: {0}")]
    UnknownInputUnit(String),

    /// Template evaluation failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// APDU encoding or decoding failed
    #[error(transparent)]
    Apdu(#[from] ecard_apdu_core::Error),

    /// The enclosing task was asked to stop
    #[error("Operation terminated")]
    Terminated,
}

impl IfdError {
    /// Position in the error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidContextHandle => ErrorKind::Context,
            Self::InvalidSlotHandle(_) | Self::NoCard(_) => ErrorKind::Slot,
            Self::IncorrectParameter(_) => ErrorKind::Parameter,
            Self::UnknownProtocol(_) | Self::Protocol(_) => ErrorKind::Protocol,
            Self::CancellationByUser(_) | Self::CancelNotPossible(_) | Self::Terminated => {
                ErrorKind::Cancellation
            }
            Self::Template(_) => ErrorKind::Template,
            Self::Apdu(e) if e.is_malformed() => ErrorKind::MalformedApdu,
            // unexpected status word in a transmit sequence
            Self::Apdu(ecard_apdu_core::Error::Response(ResponseError::Status(_))) => {
                ErrorKind::Device
            }
            Self::Apdu(_) => ErrorKind::Parameter,
            Self::UnknownIfd(_)
            | Self::UnknownIfdError(_)
            | Self::Unknown(_)
            | Self::Timeout(_)
            | Self::AuthenticationFailed(_)
            | Self::UnknownInputUnit(_) => ErrorKind::Device,
        }
    }

    /// Unknown error with a message
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::Unknown(message.into())
    }

    /// Parameter error with a message
    pub fn parameter<S: Into<String>>(message: S) -> Self {
        Self::IncorrectParameter(message.into())
    }

    /// Slot handle error with a message
    pub fn slot<S: Into<String>>(message: S) -> Self {
        Self::InvalidSlotHandle(message.into())
    }

    /// Reader error with a message
    pub fn device<S: Into<String>>(message: S) -> Self {
        Self::UnknownIfdError(message.into())
    }

    /// Whether this is the cooperative termination signal
    pub const fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl From<ScioError> for IfdError {
    fn from(error: ScioError) -> Self {
        match error.code {
            ScioErrorCode::Cancelled | ScioErrorCode::CancelledByUser => {
                Self::CancellationByUser(error.message)
            }
            ScioErrorCode::Timeout => Self::Timeout(error.message),
            ScioErrorCode::UnknownReader => Self::UnknownIfd(error.message),
            ScioErrorCode::NoSmartcard | ScioErrorCode::RemovedCard => Self::NoCard(error.message),
            ScioErrorCode::InvalidHandle => Self::InvalidSlotHandle(error.message),
            ScioErrorCode::InvalidParameter => Self::IncorrectParameter(error.message),
            _ => Self::UnknownIfdError(error.to_string()),
        }
    }
}
