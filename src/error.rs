use thiserror::Error;

use crate::session::SessionState;
use crate::transport::TransportError;

/// Crate-wide error taxonomy. Module-local errors (transport, stores)
/// convert into this at the session boundary.
#[derive(Debug, Error)]
pub enum GhostDropError {
    #[error("bluetooth is powered off or unsupported")]
    BluetoothUnavailable,

    #[error("bluetooth access not authorised")]
    BluetoothUnauthorized,

    #[error("invalid capability advertisement: {0}")]
    InvalidCapabilities(String),

    #[error("no usable transport")]
    TransportUnavailable,

    #[error("transport closed")]
    TransportClosed,

    #[error("frame encoding failed: {0}")]
    FrameEncoding(String),

    #[error("frame decoding failed: {0}")]
    FrameDecoding(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("user rejected the verification code")]
    VerificationRejected,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("io error: {0}")]
    Io(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("no resume state for transfer {0}")]
    ResumeStateMissing(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<TransportError> for GhostDropError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => GhostDropError::TransportClosed,
            TransportError::Setup(message) => GhostDropError::Io(message),
            TransportError::Io(message) => GhostDropError::Io(message),
            TransportError::Timeout(scope) => GhostDropError::Timeout(scope),
        }
    }
}

impl From<std::io::Error> for GhostDropError {
    fn from(err: std::io::Error) -> Self {
        GhostDropError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GhostDropError>;
