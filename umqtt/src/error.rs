//! Error types for umqtt.

use std::io;

/// Result type alias for umqtt.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for umqtt operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error on the transport.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration or frame construction arguments.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Frame cannot be represented on the wire.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Packet type the codec does not understand. Carries the type nibble.
    #[error("unrecognized frame type: {0:#x}")]
    UnrecognizedFrame(u8),

    /// Frame body is truncated or inconsistent with its header.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Handshake rejected or the transport could not be opened.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Session was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Automatic reconnection gave up.
    #[error("reconnect abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// A frame observer fell behind and missed frames.
    #[error("observer lagged behind by {0} frames")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(
            Error::UnrecognizedFrame(0x0f).to_string(),
            "unrecognized frame type: 0xf"
        );
        assert!(Error::ReconnectExhausted { attempts: 3 }.to_string().contains('3'));
    }
}
