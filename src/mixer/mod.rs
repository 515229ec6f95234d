//! Mixer module
//!
//! The relay core:
//! - `interest` - per-pair inclusion and fidelity decisions
//! - `payload` - budgeted packing of records into packets
//! - `tick` - the per-tick orchestrator and the transport seam

pub mod interest;
pub mod payload;
pub mod tick;

pub use interest::{DecimationPolicy, InterestDecision, InterestManager};
pub use payload::{BudgetExhausted, Inclusion};
pub use tick::{
    AvatarMixer, MixerSettings, ObserverReport, PacketDisposition, TickMetrics, TickReport,
    Transport,
};
