//! Error types for the PC/SC provider

use ecard_ifd::scio::{ScioError, ScioErrorCode};

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// Reader name that cannot be passed to PC/SC
    #[error("invalid reader name: {0}")]
    InvalidReaderName(String),

    /// The worker thread owning a card connection is gone
    #[error("connection to {0} is closed")]
    WorkerGone(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Provider error code of a PC/SC return code
pub(crate) const fn error_code(error: pcsc::Error) -> ScioErrorCode {
    use pcsc::Error as E;
    match error {
        E::InternalError => ScioErrorCode::InternalError,
        E::Cancelled | E::SystemCancelled => ScioErrorCode::Cancelled,
        E::InvalidHandle => ScioErrorCode::InvalidHandle,
        E::InvalidParameter | E::InvalidValue => ScioErrorCode::InvalidParameter,
        E::Timeout => ScioErrorCode::Timeout,
        E::SharingViolation => ScioErrorCode::SharingViolation,
        E::NoSmartcard => ScioErrorCode::NoSmartcard,
        E::ProtoMismatch => ScioErrorCode::ProtoMismatch,
        E::NotReady => ScioErrorCode::NotReady,
        E::CommError | E::CommDataLost => ScioErrorCode::CommError,
        E::UnknownReader => ScioErrorCode::UnknownReader,
        E::ReaderUnavailable => ScioErrorCode::ReaderUnavailable,
        E::NoService => ScioErrorCode::NoService,
        E::ServiceStopped | E::Shutdown => ScioErrorCode::ServiceStopped,
        E::NoReadersAvailable => ScioErrorCode::NoReadersAvailable,
        E::UnsupportedCard | E::CardUnsupported => ScioErrorCode::UnsupportedCard,
        E::UnresponsiveCard => ScioErrorCode::UnresponsiveCard,
        E::UnpoweredCard => ScioErrorCode::UnpoweredCard,
        E::ResetCard => ScioErrorCode::ResetCard,
        E::RemovedCard => ScioErrorCode::RemovedCard,
        E::CancelledByUser => ScioErrorCode::CancelledByUser,
        E::UnsupportedFeature => ScioErrorCode::UnsupportedFeature,
        _ => ScioErrorCode::UnknownError,
    }
}

/// The resource manager went away and a fresh context is needed
pub(crate) const fn is_service_gone(error: pcsc::Error) -> bool {
    matches!(
        error,
        pcsc::Error::NoService | pcsc::Error::ServiceStopped | pcsc::Error::InvalidHandle
    )
}

impl From<PcscError> for ScioError {
    fn from(error: PcscError) -> Self {
        let code = match &error {
            PcscError::Pcsc(e) => error_code(*e),
            PcscError::InvalidReaderName(_) => ScioErrorCode::UnknownReader,
            PcscError::WorkerGone(_) => ScioErrorCode::InvalidHandle,
            PcscError::Other(_) => ScioErrorCode::UnknownError,
        };
        Self::new(code, error.to_string())
    }
}

/// Shorthand for the provider traits
pub(crate) fn scio(error: pcsc::Error) -> ScioError {
    PcscError::from(error).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(error_code(pcsc::Error::RemovedCard), ScioErrorCode::RemovedCard);
        assert_eq!(error_code(pcsc::Error::Shutdown), ScioErrorCode::ServiceStopped);
        assert_eq!(error_code(pcsc::Error::CommDataLost), ScioErrorCode::CommError);
        assert_eq!(error_code(pcsc::Error::NoMemory), ScioErrorCode::UnknownError);
    }

    #[test]
    fn test_into_scio_error() {
        let error = scio(pcsc::Error::NoSmartcard);
        assert_eq!(error.code, ScioErrorCode::NoSmartcard);
        assert!(error.code.is_vanished());

        let error = ScioError::from(PcscError::InvalidReaderName("bad\0name".into()));
        assert_eq!(error.code, ScioErrorCode::UnknownReader);

        let error = ScioError::from(PcscError::WorkerGone("Reader1".into()));
        assert_eq!(error.code, ScioErrorCode::InvalidHandle);
        assert_eq!(error.message, "connection to Reader1 is closed");
    }

    #[test]
    fn test_service_gone() {
        assert!(is_service_gone(pcsc::Error::NoService));
        assert!(!is_service_gone(pcsc::Error::Timeout));
    }
}
