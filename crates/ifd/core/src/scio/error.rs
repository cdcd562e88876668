//! Errors reported by card terminal providers

use derive_more::Display;

/// Failure class reported by a provider, mirroring the PC/SC return codes the
/// IFD layer distinguishes
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScioErrorCode {
    /// Internal consistency check failed
    #[display("internal error")]
    InternalError,
    /// The operation was cancelled through its token
    #[display("cancelled")]
    Cancelled,
    /// A handle is no longer valid
    #[display("invalid handle")]
    InvalidHandle,
    /// A parameter was rejected
    #[display("invalid parameter")]
    InvalidParameter,
    /// The user specified timeout expired
    #[display("timeout")]
    Timeout,
    /// The card is in use by another connection
    #[display("sharing violation")]
    SharingViolation,
    /// No card in the reader
    #[display("no smartcard")]
    NoSmartcard,
    /// The requested protocols are incompatible with the card
    #[display("protocol mismatch")]
    ProtoMismatch,
    /// The reader or card is not ready
    #[display("not ready")]
    NotReady,
    /// Communication error with the reader
    #[display("communication error")]
    CommError,
    /// Terminal name not known to the provider
    #[display("unknown reader")]
    UnknownReader,
    /// The reader is no longer available
    #[display("reader unavailable")]
    ReaderUnavailable,
    /// The smart card service is not running
    #[display("no service")]
    NoService,
    /// The smart card service stopped
    #[display("service stopped")]
    ServiceStopped,
    /// No readers are attached
    #[display("no readers available")]
    NoReadersAvailable,
    /// The card ATR is not supported by the reader
    #[display("unsupported card")]
    UnsupportedCard,
    /// The card does not respond to a reset
    #[display("unresponsive card")]
    UnresponsiveCard,
    /// Power was removed from the card
    #[display("unpowered card")]
    UnpoweredCard,
    /// The card was reset by another connection
    #[display("reset card")]
    ResetCard,
    /// The card was removed
    #[display("removed card")]
    RemovedCard,
    /// The user cancelled an operation on the reader
    #[display("cancelled by user")]
    CancelledByUser,
    /// The reader does not implement the request
    #[display("unsupported feature")]
    UnsupportedFeature,
    /// Any other failure
    #[display("unknown error")]
    UnknownError,
}

impl ScioErrorCode {
    /// Codes meaning the card or reader behind a handle is gone
    pub const fn is_vanished(&self) -> bool {
        matches!(
            self,
            Self::ResetCard
                | Self::RemovedCard
                | Self::ReaderUnavailable
                | Self::NoSmartcard
                | Self::NoService
        )
    }
}

/// Tagged provider error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ScioError {
    /// Failure class
    pub code: ScioErrorCode,
    /// Provider supplied detail
    pub message: String,
}

impl ScioError {
    /// Create a new provider error
    pub fn new<S: Into<String>>(code: ScioErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Unknown terminal
    pub fn no_such_terminal<S: AsRef<str>>(name: S) -> Self {
        Self::new(
            ScioErrorCode::UnknownReader,
            format!("terminal '{}' does not exist", name.as_ref()),
        )
    }

    /// Operation cancelled through its token
    pub fn cancelled() -> Self {
        Self::new(ScioErrorCode::Cancelled, "operation cancelled")
    }
}
