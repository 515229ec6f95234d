//! Avatar module
//!
//! Plain data describing a participant's avatar:
//! - Pose (transform, head, joints) updated at stream rate
//! - Identity (names, model URLs, attachments) updated rarely
//! - Billboard snapshot image

pub mod data;
pub mod identity;

pub use data::{AvatarData, AvatarDataFlags, AvatarDataUpdate, HeadPose, JointUpdate};
pub use identity::{Attachment, AvatarIdentity, Billboard, MAX_BILLBOARD_SIZE};
