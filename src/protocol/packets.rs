//! Packet definitions module
//!
//! Packet types, the two-byte header shared by every packet, and the
//! client-to-mixer packet bodies. Bodies are decoded in full before anything
//! is applied to a session.

use bytes::Bytes;

use crate::avatar::{
    Attachment, AvatarDataFlags, AvatarDataUpdate, AvatarIdentity, Billboard, HeadPose,
    JointUpdate, MAX_BILLBOARD_SIZE,
};
use crate::error::ParseError;
use crate::net::buffer::PacketBuffer;

/// Current protocol version, carried in every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the packet header (type + version)
pub const HEADER_SIZE: usize = 2;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Pose update (client -> mixer)
    AvatarData = 0x01,
    /// Identity update (client -> mixer)
    AvatarIdentity = 0x02,
    /// Billboard update (client -> mixer)
    AvatarBillboard = 0x03,
    /// Pose records for many avatars (mixer -> client)
    BulkAvatarData = 0x10,
    /// Identity records (mixer -> client)
    RelayedIdentity = 0x11,
    /// Billboard records (mixer -> client)
    RelayedBillboard = 0x12,
    /// Avatars that have left (mixer -> client)
    KillAvatar = 0x13,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::AvatarData),
            0x02 => Some(Self::AvatarIdentity),
            0x03 => Some(Self::AvatarBillboard),
            0x10 => Some(Self::BulkAvatarData),
            0x11 => Some(Self::RelayedIdentity),
            0x12 => Some(Self::RelayedBillboard),
            0x13 => Some(Self::KillAvatar),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether clients are allowed to send this type
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::AvatarData | Self::AvatarIdentity | Self::AvatarBillboard
        )
    }
}

/// Write a packet header
pub fn write_header(buffer: &mut PacketBuffer, packet_type: PacketType) {
    buffer.write_ubyte(packet_type.as_u8());
    buffer.write_ubyte(PROTOCOL_VERSION);
}

/// Read and validate a packet header
pub fn read_header(buffer: &mut PacketBuffer) -> Result<PacketType, ParseError> {
    let raw = buffer.read_ubyte()?;
    let version = buffer.read_ubyte()?;
    let packet_type = PacketType::from_u8(raw).ok_or(ParseError::UnknownPacketType(raw))?;
    if version != PROTOCOL_VERSION {
        return Err(ParseError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }
    Ok(packet_type)
}

/// A packet a client sends to the mixer
pub trait IncomingPacket: Sized {
    /// The packet type
    const TYPE: PacketType;

    /// Decode the body (header already consumed)
    fn decode(buffer: &mut PacketBuffer) -> Result<Self, ParseError>;

    /// Encode the body
    fn encode(&self, buffer: &mut PacketBuffer);

    /// Encode header and body into a datagram
    fn to_bytes(&self) -> Bytes {
        let mut buffer = PacketBuffer::with_capacity(128);
        write_header(&mut buffer, Self::TYPE);
        self.encode(&mut buffer);
        buffer.freeze()
    }
}

// ============ Avatar Data ============

impl IncomingPacket for AvatarDataUpdate {
    const TYPE: PacketType = PacketType::AvatarData;

    fn decode(buffer: &mut PacketBuffer) -> Result<Self, ParseError> {
        let flags = AvatarDataFlags::from_wire(buffer.read_ubyte()?)?;

        let position = buffer.read_vec3("position")?;
        let orientation = buffer.read_quat("orientation")?;
        let scale = buffer.read_float("scale")?;
        let head = HeadPose {
            pitch: buffer.read_float("head_pitch")?,
            yaw: buffer.read_float("head_yaw")?,
            roll: buffer.read_float("head_roll")?,
        };
        let audio_loudness = buffer.read_float("audio_loudness")?;
        let hand_state = buffer.read_ubyte()?;
        let key_state = buffer.read_ubyte()?;

        let look_at = if flags.contains(AvatarDataFlags::HAS_LOOK_AT) {
            Some(buffer.read_vec3("look_at")?)
        } else {
            None
        };

        let joints = if flags.contains(AvatarDataFlags::FULL_JOINTS) {
            let count = buffer.read_smart()? as usize;
            let mut joints = Vec::with_capacity(count.min(buffer.remaining() / 16));
            for _ in 0..count {
                joints.push(buffer.read_quat("joint")?);
            }
            JointUpdate::Full(joints)
        } else if flags.contains(AvatarDataFlags::PARTIAL_JOINTS) {
            let count = buffer.read_smart()? as usize;
            let mut entries = Vec::with_capacity(count.min(buffer.remaining() / 18));
            for _ in 0..count {
                let index = buffer.read_ushort()? as usize;
                entries.push((index, buffer.read_quat("joint")?));
            }
            JointUpdate::Partial(entries)
        } else {
            JointUpdate::Unchanged
        };

        Ok(Self {
            position,
            orientation,
            scale,
            head,
            look_at,
            audio_loudness,
            hand_state,
            key_state,
            joints,
        })
    }

    fn encode(&self, buffer: &mut PacketBuffer) {
        let mut flags = AvatarDataFlags::empty();
        if self.look_at.is_some() {
            flags |= AvatarDataFlags::HAS_LOOK_AT;
        }
        match self.joints {
            JointUpdate::Full(_) => flags |= AvatarDataFlags::FULL_JOINTS,
            JointUpdate::Partial(_) => flags |= AvatarDataFlags::PARTIAL_JOINTS,
            JointUpdate::Unchanged => {}
        }

        buffer.write_ubyte(flags.bits());
        buffer.write_vec3(self.position);
        buffer.write_quat(self.orientation);
        buffer.write_float(self.scale);
        buffer.write_float(self.head.pitch);
        buffer.write_float(self.head.yaw);
        buffer.write_float(self.head.roll);
        buffer.write_float(self.audio_loudness);
        buffer.write_ubyte(self.hand_state);
        buffer.write_ubyte(self.key_state);

        if let Some(look_at) = self.look_at {
            buffer.write_vec3(look_at);
        }

        match &self.joints {
            JointUpdate::Full(joints) => {
                buffer.write_smart(joints.len() as u16);
                for joint in joints {
                    buffer.write_quat(*joint);
                }
            }
            JointUpdate::Partial(entries) => {
                buffer.write_smart(entries.len() as u16);
                for (index, joint) in entries {
                    buffer.write_ushort(*index as u16);
                    buffer.write_quat(*joint);
                }
            }
            JointUpdate::Unchanged => {}
        }
    }
}

// ============ Identity ============

/// Decode an identity body. Shared with the relayed identity record.
pub fn decode_identity(buffer: &mut PacketBuffer) -> Result<AvatarIdentity, ParseError> {
    let display_name = buffer.read_string()?;
    let face_model_url = buffer.read_string()?;
    let skeleton_model_url = buffer.read_string()?;

    let count = buffer.read_smart()? as usize;
    let mut attachments = Vec::with_capacity(count.min(buffer.remaining() / 34));
    for _ in 0..count {
        attachments.push(Attachment {
            model_url: buffer.read_string()?,
            joint_name: buffer.read_string()?,
            translation: buffer.read_vec3("attachment_translation")?,
            rotation: buffer.read_quat("attachment_rotation")?,
            scale: buffer.read_float("attachment_scale")?,
        });
    }

    Ok(AvatarIdentity {
        display_name,
        face_model_url,
        skeleton_model_url,
        attachments,
    })
}

/// Encode an identity body
pub fn encode_identity(identity: &AvatarIdentity, buffer: &mut PacketBuffer) {
    buffer.write_string(&identity.display_name);
    buffer.write_string(&identity.face_model_url);
    buffer.write_string(&identity.skeleton_model_url);
    buffer.write_smart(identity.attachments.len() as u16);
    for attachment in &identity.attachments {
        buffer.write_string(&attachment.model_url);
        buffer.write_string(&attachment.joint_name);
        buffer.write_vec3(attachment.translation);
        buffer.write_quat(attachment.rotation);
        buffer.write_float(attachment.scale);
    }
}

impl IncomingPacket for AvatarIdentity {
    const TYPE: PacketType = PacketType::AvatarIdentity;

    fn decode(buffer: &mut PacketBuffer) -> Result<Self, ParseError> {
        decode_identity(buffer)
    }

    fn encode(&self, buffer: &mut PacketBuffer) {
        encode_identity(self, buffer);
    }
}

// ============ Billboard ============

impl IncomingPacket for Billboard {
    const TYPE: PacketType = PacketType::AvatarBillboard;

    fn decode(buffer: &mut PacketBuffer) -> Result<Self, ParseError> {
        let size = buffer.read_uint()? as usize;
        if size > MAX_BILLBOARD_SIZE {
            return Err(ParseError::BillboardTooLarge {
                size,
                max: MAX_BILLBOARD_SIZE,
            });
        }
        Ok(Billboard(Bytes::from(buffer.read_bytes(size)?)))
    }

    fn encode(&self, buffer: &mut PacketBuffer) {
        buffer.write_uint(self.len() as u32);
        buffer.write_bytes(self.as_bytes());
    }
}
