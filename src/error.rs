//! Error handling module
//!
//! Defines the error types for the avatar mixer. Parse and delivery failures
//! are per-packet / per-observer and never fatal to the process.

use thiserror::Error;

use crate::session::SessionId;

/// Main error type for the avatar mixer
#[derive(Error, Debug)]
pub enum MixerError {
    /// Inbound packet could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// Outbound payload could not be handed to the transport
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Admission refused because the mixer is full
    #[error("Session limit reached ({0})")]
    SessionLimit(usize),
}

/// Inbound packet decoding errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Truncated packet: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("Unexpected packet type from client: {0:#04x}")]
    UnexpectedPacket(u8),

    #[error("Unsupported protocol version: expected {expected}, got {actual}")]
    UnsupportedVersion { expected: u8, actual: u8 },

    #[error("Invalid avatar data flags: {0:#04x}")]
    InvalidFlags(u8),

    #[error("Non-finite value in field `{0}`")]
    NonFiniteValue(&'static str),

    #[error("Invalid string encoding")]
    InvalidString,

    #[error("Unterminated string")]
    UnterminatedString,

    #[error("Joint index {index} out of range ({joints} joints)")]
    JointIndexOutOfRange { index: usize, joints: usize },

    #[error("Billboard too large: {size} bytes (max: {max})")]
    BillboardTooLarge { size: usize, max: usize },
}

/// Outbound delivery errors. Never fatal to the tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Outbound queue full")]
    QueueFull,

    #[error("Outbound channel closed")]
    ChannelClosed,

    #[error("Peer gone: session {0}")]
    PeerGone(SessionId),
}

/// Result type alias for mixer operations
pub type Result<T> = std::result::Result<T, MixerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParseError::Truncated {
            needed: 4,
            remaining: 1,
        };
        assert_eq!(err.to_string(), "Truncated packet: needed 4 bytes, 1 remaining");

        let err = ParseError::UnknownPacketType(0x7f);
        assert_eq!(err.to_string(), "Unknown packet type: 0x7f");

        let err = DeliveryError::PeerGone(12);
        assert_eq!(err.to_string(), "Peer gone: session 12");
    }

    #[test]
    fn test_error_conversion() {
        let err: MixerError = ParseError::InvalidString.into();
        assert!(matches!(err, MixerError::Protocol(ParseError::InvalidString)));

        let err: MixerError = DeliveryError::QueueFull.into();
        assert_eq!(err.to_string(), "Delivery error: Outbound queue full");
    }
}
