//! Relay record encoder
//!
//! Encodes the records the mixer relays to observers. Every outbound packet
//! is a header followed by a run of self-delimiting records of one kind:
//!
//! - `BulkAvatarData`: uuid, fidelity byte, pose body
//! - `RelayedIdentity`: uuid, identity body
//! - `RelayedBillboard`: uuid, `u32` length, image bytes
//! - `KillAvatar`: uuid
//!
//! A candidate's records are encoded once per tick and shared by every
//! observer that includes it.

use bytes::Bytes;
use glam::{Quat, Vec3};
use uuid::Uuid;

use super::packets::{decode_identity, encode_identity, read_header, PacketType};
use crate::avatar::{AvatarData, AvatarDataFlags, AvatarIdentity, Billboard};
use crate::error::ParseError;
use crate::net::buffer::PacketBuffer;
use crate::session::{AvatarSnapshot, SessionId};

/// Size of a uuid on the wire
pub const UUID_SIZE: usize = 16;

/// Pose fidelity of a relayed record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Fidelity {
    /// Transform, head, look-at and joints
    Full = 0,
    /// Transform and head only
    Reduced = 1,
}

impl Fidelity {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Full),
            1 => Some(Self::Reduced),
            _ => None,
        }
    }
}

/// One candidate's relay records for the current tick
#[derive(Debug, Clone)]
pub struct CandidateRecords {
    pub id: SessionId,
    pub uuid: Uuid,
    pub position: Vec3,
    pub identity_timestamp: u64,
    pub billboard_timestamp: u64,
    pub full_pose: Bytes,
    pub reduced_pose: Bytes,
    pub identity: Option<Bytes>,
    pub billboard: Option<Bytes>,
}

impl CandidateRecords {
    /// Encode every record for a candidate from one consistent snapshot
    pub fn encode(id: SessionId, uuid: Uuid, snapshot: &AvatarSnapshot) -> Self {
        Self {
            id,
            uuid,
            position: snapshot.data.position,
            identity_timestamp: snapshot.identity_change_timestamp,
            billboard_timestamp: snapshot.billboard_change_timestamp,
            full_pose: encode_pose_record(uuid, &snapshot.data, Fidelity::Full),
            reduced_pose: encode_pose_record(uuid, &snapshot.data, Fidelity::Reduced),
            identity: snapshot
                .identity
                .as_ref()
                .map(|identity| encode_identity_record(uuid, identity)),
            billboard: snapshot
                .billboard
                .as_ref()
                .map(|billboard| encode_billboard_record(uuid, billboard)),
        }
    }

    /// The pose record for the given fidelity
    pub fn pose(&self, fidelity: Fidelity) -> &Bytes {
        match fidelity {
            Fidelity::Full => &self.full_pose,
            Fidelity::Reduced => &self.reduced_pose,
        }
    }
}

// ============ Record Encoding ============

/// Encode a pose record
pub fn encode_pose_record(uuid: Uuid, avatar: &AvatarData, fidelity: Fidelity) -> Bytes {
    let mut buffer = PacketBuffer::with_capacity(64 + avatar.joints.len() * 16);
    buffer.write_bytes(uuid.as_bytes());
    buffer.write_ubyte(fidelity as u8);

    buffer.write_vec3(avatar.position);
    buffer.write_quat(avatar.orientation);
    buffer.write_float(avatar.scale);
    buffer.write_float(avatar.head.pitch);
    buffer.write_float(avatar.head.yaw);
    buffer.write_float(avatar.head.roll);
    buffer.write_float(avatar.audio_loudness);

    if fidelity == Fidelity::Full {
        buffer.write_ubyte(avatar.hand_state);
        buffer.write_ubyte(avatar.key_state);

        let mut flags = AvatarDataFlags::empty();
        if avatar.look_at.is_some() {
            flags |= AvatarDataFlags::HAS_LOOK_AT;
        }
        if !avatar.joints.is_empty() {
            flags |= AvatarDataFlags::FULL_JOINTS;
        }
        buffer.write_ubyte(flags.bits());

        if let Some(look_at) = avatar.look_at {
            buffer.write_vec3(look_at);
        }
        if !avatar.joints.is_empty() {
            buffer.write_smart(avatar.joints.len() as u16);
            for joint in &avatar.joints {
                buffer.write_quat(*joint);
            }
        }
    }

    buffer.freeze()
}

/// Encode an identity record
pub fn encode_identity_record(uuid: Uuid, identity: &AvatarIdentity) -> Bytes {
    let mut buffer = PacketBuffer::with_capacity(128);
    buffer.write_bytes(uuid.as_bytes());
    encode_identity(identity, &mut buffer);
    buffer.freeze()
}

/// Encode a billboard record
pub fn encode_billboard_record(uuid: Uuid, billboard: &Billboard) -> Bytes {
    let mut buffer = PacketBuffer::with_capacity(UUID_SIZE + 4 + billboard.len());
    buffer.write_bytes(uuid.as_bytes());
    buffer.write_uint(billboard.len() as u32);
    buffer.write_bytes(billboard.as_bytes());
    buffer.freeze()
}

/// Encode a kill record
pub fn encode_kill_record(uuid: Uuid) -> Bytes {
    Bytes::copy_from_slice(uuid.as_bytes())
}

// ============ Record Decoding ============

/// A decoded pose record
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedPose {
    pub uuid: Uuid,
    pub fidelity: Fidelity,
    pub position: Vec3,
    pub orientation: Quat,
    pub look_at: Option<Vec3>,
    pub joints: Vec<Quat>,
}

/// A decoded mixer-to-client packet
#[derive(Debug, Clone, PartialEq)]
pub enum RelayedPacket {
    Poses(Vec<RelayedPose>),
    Identities(Vec<(Uuid, AvatarIdentity)>),
    Billboards(Vec<(Uuid, Bytes)>),
    Kills(Vec<Uuid>),
}

fn read_uuid(buffer: &mut PacketBuffer) -> Result<Uuid, ParseError> {
    let bytes = buffer.read_bytes(UUID_SIZE)?;
    let mut raw = [0u8; UUID_SIZE];
    raw.copy_from_slice(&bytes);
    Ok(Uuid::from_bytes(raw))
}

fn read_pose(buffer: &mut PacketBuffer) -> Result<RelayedPose, ParseError> {
    let uuid = read_uuid(buffer)?;
    let raw = buffer.read_ubyte()?;
    let fidelity = Fidelity::from_u8(raw).ok_or(ParseError::InvalidFlags(raw))?;

    let position = buffer.read_vec3("position")?;
    let orientation = buffer.read_quat("orientation")?;
    // scale, head pitch/yaw/roll, loudness
    for field in ["scale", "head_pitch", "head_yaw", "head_roll", "audio_loudness"] {
        buffer.read_float(field)?;
    }

    let mut look_at = None;
    let mut joints = Vec::new();
    if fidelity == Fidelity::Full {
        buffer.read_ubyte()?;
        buffer.read_ubyte()?;
        let flags = AvatarDataFlags::from_wire(buffer.read_ubyte()?)?;
        if flags.contains(AvatarDataFlags::HAS_LOOK_AT) {
            look_at = Some(buffer.read_vec3("look_at")?);
        }
        if flags.contains(AvatarDataFlags::FULL_JOINTS) {
            let count = buffer.read_smart()? as usize;
            for _ in 0..count {
                joints.push(buffer.read_quat("joint")?);
            }
        }
    }

    Ok(RelayedPose {
        uuid,
        fidelity,
        position,
        orientation,
        look_at,
        joints,
    })
}

/// Decode a packet produced by the mixer
pub fn decode_relayed(data: &[u8]) -> Result<RelayedPacket, ParseError> {
    let mut buffer = PacketBuffer::from_bytes(data);
    let packet_type = read_header(&mut buffer)?;

    let packet = match packet_type {
        PacketType::BulkAvatarData => {
            let mut poses = Vec::new();
            while buffer.has_remaining() {
                poses.push(read_pose(&mut buffer)?);
            }
            RelayedPacket::Poses(poses)
        }
        PacketType::RelayedIdentity => {
            let mut identities = Vec::new();
            while buffer.has_remaining() {
                let uuid = read_uuid(&mut buffer)?;
                identities.push((uuid, decode_identity(&mut buffer)?));
            }
            RelayedPacket::Identities(identities)
        }
        PacketType::RelayedBillboard => {
            let mut billboards = Vec::new();
            while buffer.has_remaining() {
                let uuid = read_uuid(&mut buffer)?;
                let size = buffer.read_uint()? as usize;
                billboards.push((uuid, Bytes::from(buffer.read_bytes(size)?)));
            }
            RelayedPacket::Billboards(billboards)
        }
        PacketType::KillAvatar => {
            let mut kills = Vec::new();
            while buffer.has_remaining() {
                kills.push(read_uuid(&mut buffer)?);
            }
            RelayedPacket::Kills(kills)
        }
        other => return Err(ParseError::UnexpectedPacket(other.as_u8())),
    };

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::buffer::PacketBuffer;
    use crate::protocol::packets::write_header;

    fn wrap(packet_type: PacketType, records: &[&Bytes]) -> Bytes {
        let mut buffer = PacketBuffer::new();
        write_header(&mut buffer, packet_type);
        for record in records {
            buffer.write_bytes(record);
        }
        buffer.freeze()
    }

    fn avatar() -> AvatarData {
        AvatarData {
            position: Vec3::new(4.0, 0.0, -2.0),
            look_at: Some(Vec3::Z),
            joints: vec![Quat::IDENTITY; 5],
            ..Default::default()
        }
    }

    #[test]
    fn test_reduced_pose_is_smaller() {
        let uuid = Uuid::new_v4();
        let full = encode_pose_record(uuid, &avatar(), Fidelity::Full);
        let reduced = encode_pose_record(uuid, &avatar(), Fidelity::Reduced);
        assert!(reduced.len() < full.len());
    }

    #[test]
    fn test_decode_pose_records() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let full = encode_pose_record(a, &avatar(), Fidelity::Full);
        let reduced = encode_pose_record(b, &avatar(), Fidelity::Reduced);

        let packet = decode_relayed(&wrap(PacketType::BulkAvatarData, &[&full, &reduced])).unwrap();
        let RelayedPacket::Poses(poses) = packet else {
            panic!("expected poses");
        };

        assert_eq!(poses.len(), 2);
        assert_eq!(poses[0].uuid, a);
        assert_eq!(poses[0].fidelity, Fidelity::Full);
        assert_eq!(poses[0].joints.len(), 5);
        assert_eq!(poses[0].look_at, Some(Vec3::Z));
        assert_eq!(poses[1].uuid, b);
        assert_eq!(poses[1].fidelity, Fidelity::Reduced);
        assert!(poses[1].joints.is_empty());
        assert_eq!(poses[1].look_at, None);
        assert_eq!(poses[1].position, Vec3::new(4.0, 0.0, -2.0));
    }

    #[test]
    fn test_decode_kill_records() {
        let a = Uuid::new_v4();
        let packet = decode_relayed(&wrap(PacketType::KillAvatar, &[&encode_kill_record(a)])).unwrap();
        assert_eq!(packet, RelayedPacket::Kills(vec![a]));
    }

    #[test]
    fn test_candidate_records_without_identity() {
        let snapshot = AvatarSnapshot {
            data: avatar(),
            identity: None,
            billboard: Some(Billboard(Bytes::from_static(b"img"))),
            identity_change_timestamp: 0,
            billboard_change_timestamp: 7,
        };
        let records = CandidateRecords::encode(3, Uuid::new_v4(), &snapshot);

        assert!(records.identity.is_none());
        assert_eq!(
            records.billboard.as_ref().map(|b| b.len()),
            Some(UUID_SIZE + 4 + 3)
        );
        assert_eq!(records.billboard_timestamp, 7);
        assert_eq!(records.pose(Fidelity::Full), &records.full_pose);
    }
}
