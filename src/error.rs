//! Error types for the protocol core.
//!
//! Every fallible operation in this crate returns [`Result`], a type alias
//! around [`ProtocolError`]. Library errors (`std::io`, `serde_json`,
//! `openssl`) convert in automatically via `#[from]`; the remaining variants
//! cover packet validation, channel lifecycle, and pairing.

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced by the channel, device, and manager layers.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS/SSL error surfaced from the certificate layer.
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or parsing error.
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Bytes that are not a JSON object.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// JSON that does not satisfy the packet envelope.
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// A required field is absent.
    #[error("Missing field: {0}")]
    MissingField(String),

    /// A field is present but has the wrong shape.
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// Packet exceeds the buffer bound for this peer's trust level.
    #[error("Message too large: {actual} bytes (max {max})")]
    MessageTooLarge { actual: usize, max: usize },

    /// Write or read after close, or close observed mid-operation.
    #[error("Connection closed")]
    ConnectionClosed,

    /// `send_packet` with no current channel.
    #[error("Not connected")]
    NotConnected,

    /// Operation denied because the peer is not paired.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Payload transfer completed with fewer bytes than `payloadSize` promised.
    #[error("Partial input: expected {expected} bytes, got {actual}")]
    PartialInput { expected: i64, actual: i64 },

    /// Operation aborted via its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Transport does not implement the requested auxiliary operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Requested device doesn't exist in the registry.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but isn't in the state the caller expected.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Local certificate or known-peers state could not be read or written.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// True for errors that may succeed if the caller retries, as opposed to
    /// ones that need a state change (pairing, configuration) first.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::ConnectionClosed | ProtocolError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_is_stable() {
        assert_eq!(
            ProtocolError::DeviceNotFound("abc".into()).to_string(),
            "Device not found: abc"
        );
        assert_eq!(ProtocolError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(
            ProtocolError::MessageTooLarge { actual: 10, max: 5 }.to_string(),
            "Message too large: 10 bytes (max 5)"
        );
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: ProtocolError = io_err.into();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn recoverable_classification() {
        assert!(ProtocolError::NotConnected.is_recoverable());
        assert!(!ProtocolError::PermissionDenied("x".into()).is_recoverable());
    }
}
