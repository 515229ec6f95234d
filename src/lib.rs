//! Avatar Mixer Library
//!
//! Server-side core of a multi-user avatar relay. Participants stream their
//! avatar state to the mixer; on a fixed tick the mixer relays to each
//! participant the subset of other avatars it needs, at a rate set by
//! distance and by how stale its copy of their appearance is.
//!
//! ## Modules
//!
//! - `avatar` - Pose, identity and billboard data
//! - `session` - Per-participant state and the session registry
//! - `protocol` - Wire format, packet parser and relay encoder
//! - `mixer` - Interest management, payload assembly and the tick
//! - `stats` - Diagnostic snapshots
//! - `net` - UDP front end
//! - `api` - HTTP management API
//! - `config` - Mixer configuration management
//! - `error` - Error types and result definitions

pub mod api;
pub mod avatar;
pub mod config;
pub mod error;
pub mod mixer;
pub mod net;
pub mod protocol;
pub mod session;
pub mod state;
pub mod stats;

// Re-export commonly used types
pub use config::MixerConfig;
pub use error::{DeliveryError, MixerError, ParseError, Result};
pub use mixer::{AvatarMixer, Transport};
pub use session::{ClientSession, SessionId, SessionRegistry};
pub use state::AppState;
pub use stats::{MixerSnapshot, StatsReporter};

/// Mixer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
