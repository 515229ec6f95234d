//! Avatar identity and billboard
//!
//! Appearance metadata that changes rarely and is relayed only when an
//! observer's copy is stale.

use bytes::Bytes;
use glam::{Quat, Vec3};

/// Largest billboard image accepted from a client
pub const MAX_BILLBOARD_SIZE: usize = 65_000;

/// A model attached to one of the avatar's joints
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub model_url: String,
    pub joint_name: String,
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: f32,
}

/// Who the avatar is and what it looks like
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvatarIdentity {
    pub display_name: String,
    pub face_model_url: String,
    pub skeleton_model_url: String,
    pub attachments: Vec<Attachment>,
}

/// Static thumbnail of the avatar, shown by far-away observers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Billboard(pub Bytes);

impl Billboard {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
