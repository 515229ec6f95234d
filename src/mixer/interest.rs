//! Interest management
//!
//! Decides, for one (observer, candidate) pair, whether the candidate goes
//! into the observer's payload this tick and at what fidelity. Decisions are
//! pure: they read only the views passed in.
//!
//! - Within the observer's full-rate distance: every tick, full pose.
//! - Beyond it: reduced pose on a decimated schedule whose interval grows
//!   with distance, capped so far avatars still refresh.
//! - A stale identity or billboard forces inclusion regardless of schedule.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::protocol::Fidelity;
use crate::session::{DeliveryRecord, SessionId};

/// Reduced-rate schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecimationPolicy {
    /// Distance beyond the full-rate threshold that adds one tick of interval
    #[serde(default = "default_distance_step")]
    pub distance_step: f32,
    /// Longest interval between poses for any candidate
    #[serde(default = "default_max_interval_ticks")]
    pub max_interval_ticks: u64,
}

fn default_distance_step() -> f32 {
    10.0
}

fn default_max_interval_ticks() -> u64 {
    8
}

impl Default for DecimationPolicy {
    fn default() -> Self {
        Self {
            distance_step: default_distance_step(),
            max_interval_ticks: default_max_interval_ticks(),
        }
    }
}

impl DecimationPolicy {
    /// Interval in ticks for a candidate `excess` metres past the full-rate
    /// threshold. Always at least 1.
    pub fn interval(&self, excess: f32) -> u64 {
        let cap = self.max_interval_ticks.max(1);
        if excess <= 0.0 || self.distance_step <= 0.0 {
            return 1;
        }
        let steps = (excess / self.distance_step).ceil();
        if !steps.is_finite() || steps >= cap as f32 {
            return cap;
        }
        (1 + steps as u64).min(cap)
    }
}

/// What the interest decision needs from the observer
#[derive(Debug, Clone, Copy)]
pub struct ObserverView {
    pub id: SessionId,
    pub position: Vec3,
    pub max_full_rate_distance: f32,
}

/// What the interest decision needs from a candidate
#[derive(Debug, Clone, Copy)]
pub struct CandidateView {
    pub id: SessionId,
    pub position: Vec3,
    pub has_received_first_packets: bool,
    pub identity_timestamp: u64,
    pub billboard_timestamp: u64,
}

/// Outcome for one included candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterestDecision {
    /// Pose record to send, if any
    pub pose: Option<Fidelity>,
    /// Identity is newer than what the observer has
    pub send_identity: bool,
    /// Billboard is newer than what the observer has
    pub send_billboard: bool,
    /// Observer-candidate distance
    pub distance: f32,
}

impl InterestDecision {
    pub fn is_empty(&self) -> bool {
        self.pose.is_none() && !self.send_identity && !self.send_billboard
    }
}

/// Per-pair inclusion and fidelity decisions
#[derive(Debug, Clone, Copy, Default)]
pub struct InterestManager {
    policy: DecimationPolicy,
}

impl InterestManager {
    pub fn new(policy: DecimationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DecimationPolicy {
        &self.policy
    }

    /// Decide whether `candidate` goes into `observer`'s payload on `tick`.
    /// `record` is what the observer has already been sent about the
    /// candidate. Returns `None` when nothing is sent.
    pub fn evaluate(
        &self,
        observer: &ObserverView,
        candidate: &CandidateView,
        record: Option<&DeliveryRecord>,
        tick: u64,
    ) -> Option<InterestDecision> {
        if candidate.id == observer.id || !candidate.has_received_first_packets {
            return None;
        }

        let distance = observer.position.distance(candidate.position);
        let record = record.copied().unwrap_or_default();

        let send_identity = candidate.identity_timestamp > record.identity_timestamp;
        let send_billboard = candidate.billboard_timestamp > record.billboard_timestamp;
        let forced = send_identity || send_billboard;

        let pose = if distance <= observer.max_full_rate_distance {
            Some(Fidelity::Full)
        } else if forced || self.reduced_rate_due(observer, candidate, &record, distance, tick) {
            Some(Fidelity::Reduced)
        } else {
            None
        };

        let decision = InterestDecision {
            pose,
            send_identity,
            send_billboard,
            distance,
        };
        (!decision.is_empty()).then_some(decision)
    }

    fn reduced_rate_due(
        &self,
        observer: &ObserverView,
        candidate: &CandidateView,
        record: &DeliveryRecord,
        distance: f32,
        tick: u64,
    ) -> bool {
        let last_pose_tick = match record.last_pose_tick {
            Some(last) => last,
            None => return true,
        };
        if tick.saturating_sub(last_pose_tick) >= self.policy.max_interval_ticks.max(1) {
            return true;
        }
        let interval = self
            .policy
            .interval(distance - observer.max_full_rate_distance);
        tick.wrapping_add(candidate.id) % interval == 0
    }
}
