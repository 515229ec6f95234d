//! Avatar pose data
//!
//! The transform and joint state a participant streams many times per
//! second. Updates are validated in full before any field is touched.

use bitflags::bitflags;
use glam::{Quat, Vec3};

use crate::error::ParseError;

bitflags! {
    /// Optional sections present in an avatar-data packet
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AvatarDataFlags: u8 {
        /// A look-at target follows the fixed transform block
        const HAS_LOOK_AT = 1 << 0;
        /// The complete joint array follows and replaces the current one
        const FULL_JOINTS = 1 << 1;
        /// A sparse list of (index, rotation) joint updates follows
        const PARTIAL_JOINTS = 1 << 2;
    }
}

impl Default for AvatarDataFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl AvatarDataFlags {
    /// Parse flags from the wire, rejecting unknown bits and the
    /// full/partial joint combination
    pub fn from_wire(bits: u8) -> Result<Self, ParseError> {
        let flags = Self::from_bits(bits).ok_or(ParseError::InvalidFlags(bits))?;
        if flags.contains(Self::FULL_JOINTS | Self::PARTIAL_JOINTS) {
            return Err(ParseError::InvalidFlags(bits));
        }
        Ok(flags)
    }
}

/// Head orientation in degrees
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeadPose {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

/// A participant's latest pose
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarData {
    /// World position in metres
    pub position: Vec3,
    /// Body orientation
    pub orientation: Quat,
    /// Uniform avatar scale
    pub scale: f32,
    /// Head orientation relative to the body
    pub head: HeadPose,
    /// Where the avatar is looking, if it has ever said
    pub look_at: Option<Vec3>,
    /// Current microphone loudness
    pub audio_loudness: f32,
    /// Hand gesture state
    pub hand_state: u8,
    /// Keyboard activity state
    pub key_state: u8,
    /// Skeleton joint rotations
    pub joints: Vec<Quat>,
}

impl Default for AvatarData {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            scale: 1.0,
            head: HeadPose::default(),
            look_at: None,
            audio_loudness: 0.0,
            hand_state: 0,
            key_state: 0,
            joints: Vec::new(),
        }
    }
}

/// How a packet changes the joint array
#[derive(Debug, Clone, Default, PartialEq)]
pub enum JointUpdate {
    /// Joints are not part of this packet
    #[default]
    Unchanged,
    /// Replace the whole array
    Full(Vec<Quat>),
    /// Overwrite individual joints by index
    Partial(Vec<(usize, Quat)>),
}

/// A decoded avatar-data packet, not yet applied to any session
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarDataUpdate {
    pub position: Vec3,
    pub orientation: Quat,
    pub scale: f32,
    pub head: HeadPose,
    pub look_at: Option<Vec3>,
    pub audio_loudness: f32,
    pub hand_state: u8,
    pub key_state: u8,
    pub joints: JointUpdate,
}

impl AvatarData {
    /// Apply a decoded update. Fails without modifying `self` if the update
    /// addresses a joint that does not exist.
    pub fn apply(&mut self, update: AvatarDataUpdate) -> Result<(), ParseError> {
        if let JointUpdate::Partial(entries) = &update.joints {
            let joints = self.joints.len();
            if let Some(&(index, _)) = entries.iter().find(|(index, _)| *index >= joints) {
                return Err(ParseError::JointIndexOutOfRange { index, joints });
            }
        }

        self.position = update.position;
        self.orientation = update.orientation;
        self.scale = update.scale;
        self.head = update.head;
        self.audio_loudness = update.audio_loudness;
        self.hand_state = update.hand_state;
        self.key_state = update.key_state;
        if update.look_at.is_some() {
            self.look_at = update.look_at;
        }

        match update.joints {
            JointUpdate::Unchanged => {}
            JointUpdate::Full(joints) => self.joints = joints,
            JointUpdate::Partial(entries) => {
                for (index, rotation) in entries {
                    self.joints[index] = rotation;
                }
            }
        }

        Ok(())
    }

    /// Euclidean distance between two avatars
    pub fn distance_to(&self, other: &AvatarData) -> f32 {
        self.position.distance(other.position)
    }
}
