//! Session module
//!
//! Per-participant state and the registry of active participants:
//! - `client_data` - avatar state, first-packets gate, delivery bookkeeping
//! - `registry` - admission, tick-boundary removal, removal listeners

pub mod client_data;
pub mod registry;

pub use client_data::{
    usec_timestamp_now, AvatarSnapshot, ClientSession, DeliveryRecord, SessionId,
};
pub use registry::{SessionListener, SessionRegistry, DEFAULT_MAX_FULL_RATE_DISTANCE};
