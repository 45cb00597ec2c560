//! Error types and handling for the peer-to-peer overlay.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is [`OverlayError`]. The variants are grouped by the layer that produced
//! them so callers can tell a framing problem from a dead socket.

use thiserror::Error;

/// Result type alias for the overlay library
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Comprehensive error type for all overlay operations
#[derive(Error, Debug, Clone)]
pub enum OverlayError {
    /// Envelope construction and wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket, dial and listener errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

/// Envelope construction and decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Envelope violates a construction invariant
    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// Line could not be parsed as an envelope
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    /// Line exceeds the maximum frame size
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Writing a line to a peer failed; the link is closed afterwards
    #[error("Send to {peer} failed: {reason}")]
    SendFailure { peer: String, reason: String },

    /// Outbound connection attempt failed
    #[error("Dial to {peer} failed: {reason}")]
    DialFailed { peer: String, reason: String },

    /// Listener could not accept a socket
    #[error("Accept failed: {reason}")]
    AcceptFailed { reason: String },

    /// Listener could not bind its address
    #[error("Failed to bind {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// Deadline elapsed during a network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

impl OverlayError {
    /// Returns true if the error came from bad bytes on the wire
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Protocol(ProtocolError::MalformedEnvelope { .. })
                | Self::Protocol(ProtocolError::MessageTooLarge { .. })
        )
    }
}

impl From<std::io::Error> for OverlayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = OverlayError::Protocol(ProtocolError::InvalidEnvelope {
            reason: "file envelope requires a filename".to_string(),
        });
        assert!(error.to_string().contains("Invalid envelope"));
        assert!(error.to_string().contains("filename"));
    }

    #[test]
    fn test_protocol_violations() {
        let malformed = OverlayError::Protocol(ProtocolError::MalformedEnvelope {
            reason: "expected value".to_string(),
        });
        assert!(malformed.is_protocol_violation());

        let timeout = OverlayError::Network(NetworkError::Timeout {
            operation: "read".to_string(),
        });
        assert!(!timeout.is_protocol_violation());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let error: OverlayError = io.into();
        assert!(matches!(error, OverlayError::Io(ref msg) if msg.contains("pipe closed")));
    }
}
