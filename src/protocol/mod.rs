//! Protocol module
//!
//! Wire format of the avatar mixer:
//! - `packets` - packet types, header, client packet bodies
//! - `parser` - decoding and applying client packets to a session
//! - `encoder` - relay records sent to observers

pub mod encoder;
pub mod packets;
pub mod parser;

pub use encoder::{decode_relayed, CandidateRecords, Fidelity, RelayedPacket, RelayedPose};
pub use packets::{IncomingPacket, PacketType, HEADER_SIZE, PROTOCOL_VERSION};
pub use parser::{PacketParser, ParseOutcome};
