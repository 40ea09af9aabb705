//! Error types for rsocket-engine.

use thiserror::Error;

/// Protocol error codes carried by ERROR frames.
///
/// Codes below `0x0300` with the exception of `APPLICATION_ERROR`,
/// `REJECTED`, `CANCELED` and `INVALID` are connection-scoped and travel on
/// stream 0; the rest are stream-scoped.
pub mod error_codes {
    /// The SETUP frame is invalid for the server.
    pub const INVALID_SETUP: u32 = 0x0001;
    /// Some (or all) of the parameters specified by the client are unsupported.
    pub const UNSUPPORTED_SETUP: u32 = 0x0002;
    /// The server rejected the SETUP.
    pub const REJECTED_SETUP: u32 = 0x0003;
    /// The server rejected the RESUME.
    pub const REJECTED_RESUME: u32 = 0x0004;
    /// The connection is being terminated.
    pub const CONNECTION_ERROR: u32 = 0x0101;
    /// Application-layer error on a stream.
    pub const APPLICATION_ERROR: u32 = 0x0201;
    /// The responder rejected the request.
    pub const REJECTED: u32 = 0x0202;
    /// The responder canceled the request.
    pub const CANCELED: u32 = 0x0203;
    /// The request is invalid.
    pub const INVALID: u32 = 0x0204;
}

/// Main error type for all rsocket-engine operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame length does not fit the 24-bit length field.
    #[error("frame length {len} exceeds 24-bit maximum")]
    FrameTooLarge { len: usize },

    /// Malformed or forbidden frame content.
    #[error("illegal frame: {0}")]
    IllegalFrame(String),

    /// Protocol violation (wrong phase, wrong side, reserved values).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error carried by or destined for an ERROR frame on a stream.
    #[error("stream error {code:#06x}: {message}")]
    Stream { code: u32, message: String },

    /// Handler does not serve this interaction model.
    #[error("unsupported interaction: {0}")]
    UnsupportedInteraction(&'static str),

    /// The connection closed before or during the operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// The stream was canceled by the peer or by termination.
    #[error("stream canceled")]
    Canceled,
}

impl RSocketError {
    /// Application-level stream error with the default code.
    pub fn application(message: impl Into<String>) -> Self {
        RSocketError::Stream {
            code: error_codes::APPLICATION_ERROR,
            message: message.into(),
        }
    }

    /// Error code this error maps to when encoded into an ERROR frame.
    pub fn error_code(&self) -> u32 {
        match self {
            RSocketError::Stream { code, .. } => *code,
            RSocketError::Protocol(_) | RSocketError::IllegalFrame(_) => {
                error_codes::CONNECTION_ERROR
            }
            RSocketError::ConnectionClosed => error_codes::CONNECTION_ERROR,
            RSocketError::Canceled => error_codes::CANCELED,
            RSocketError::UnsupportedInteraction(_) => error_codes::REJECTED,
            _ => error_codes::APPLICATION_ERROR,
        }
    }
}

/// Result type alias using RSocketError.
pub type Result<T> = std::result::Result<T, RSocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_code() {
        let err = RSocketError::application("boom");
        assert_eq!(err.error_code(), error_codes::APPLICATION_ERROR);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_connection_scoped_codes() {
        assert_eq!(
            RSocketError::Protocol("bad".into()).error_code(),
            error_codes::CONNECTION_ERROR
        );
        assert_eq!(
            RSocketError::ConnectionClosed.error_code(),
            error_codes::CONNECTION_ERROR
        );
    }

    #[test]
    fn test_rejected_and_canceled() {
        assert_eq!(
            RSocketError::UnsupportedInteraction("request_stream").error_code(),
            error_codes::REJECTED
        );
        assert_eq!(RSocketError::Canceled.error_code(), error_codes::CANCELED);
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: RSocketError = io.into();
        assert!(matches!(err, RSocketError::Io(_)));
    }
}
