//! Inbound packet parser
//!
//! Decodes a raw client payload and applies it to the sending session. A
//! payload is decoded and validated in full before the session's state lock
//! is taken; a failure leaves the session exactly as it was.

use tracing::trace;

use super::packets::{read_header, IncomingPacket, PacketType};
use crate::avatar::{AvatarDataUpdate, AvatarIdentity, Billboard};
use crate::error::ParseError;
use crate::net::buffer::PacketBuffer;
use crate::session::{usec_timestamp_now, ClientSession};

/// Result of applying one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Type of the applied packet
    pub packet_type: PacketType,
    /// Bytes consumed, header included
    pub bytes_consumed: usize,
    /// Whether an identity or billboard differed from the stored one
    pub appearance_changed: bool,
}

/// Stateless decoder for client packets
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketParser;

impl PacketParser {
    /// Apply `data` to `session`, returning the number of bytes consumed
    pub fn parse_data(session: &ClientSession, data: &[u8]) -> Result<usize, ParseError> {
        Self::parse(session, data).map(|outcome| outcome.bytes_consumed)
    }

    /// Apply `data` to `session`. Parse failures are counted on the session.
    pub fn parse(session: &ClientSession, data: &[u8]) -> Result<ParseOutcome, ParseError> {
        let result = Self::decode_and_apply(session, data);
        match &result {
            Ok(outcome) if outcome.bytes_consumed < data.len() => {
                trace!(
                    session_id = session.id,
                    packet_type = ?outcome.packet_type,
                    trailing = data.len() - outcome.bytes_consumed,
                    "Trailing bytes after packet body"
                );
            }
            Ok(_) => {}
            Err(_) => session.record_parse_error(),
        }
        result
    }

    fn decode_and_apply(session: &ClientSession, data: &[u8]) -> Result<ParseOutcome, ParseError> {
        let mut buffer = PacketBuffer::from_bytes(data);
        let packet_type = read_header(&mut buffer)?;

        let appearance_changed = match packet_type {
            PacketType::AvatarData => {
                let update = AvatarDataUpdate::decode(&mut buffer)?;
                session.apply_avatar_data(update)?;
                false
            }
            PacketType::AvatarIdentity => {
                let identity = AvatarIdentity::decode(&mut buffer)?;
                session.apply_identity(identity, usec_timestamp_now())
            }
            PacketType::AvatarBillboard => {
                let billboard = Billboard::decode(&mut buffer)?;
                session.apply_billboard(billboard, usec_timestamp_now())
            }
            other => return Err(ParseError::UnexpectedPacket(other.as_u8())),
        };

        Ok(ParseOutcome {
            packet_type,
            bytes_consumed: buffer.read_position(),
            appearance_changed,
        })
    }
}
