//! Mixer statistics
//!
//! Read-only snapshots of the mixer for diagnostics. Taking a snapshot reads
//! atomics and per-session read locks only; it never waits on a tick.

use std::sync::Arc;

use serde::Serialize;

use crate::mixer::AvatarMixer;
use crate::session::{ClientSession, SessionId, SessionRegistry};

/// Distribution of per-session sent counts for the last tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SentDistribution {
    pub min: u32,
    pub max: u32,
    pub mean: f64,
    pub total: u64,
}

impl SentDistribution {
    fn from_counts(counts: &[u32]) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        let total: u64 = counts.iter().map(|&c| c as u64).sum();
        Self {
            min: counts.iter().copied().min().unwrap_or(0),
            max: counts.iter().copied().max().unwrap_or(0),
            mean: total as f64 / counts.len() as f64,
            total,
        }
    }
}

/// One session as seen by the stats surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub id: SessionId,
    pub uuid: String,
    pub address: String,
    pub display_name: Option<String>,
    pub has_received_first_packets: bool,
    pub num_avatars_sent_last_frame: u32,
    pub full_rate_distance: f32,
    pub max_full_rate_distance: f32,
    pub identity_change_timestamp: u64,
    pub billboard_change_timestamp: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub parse_errors: u64,
}

impl SessionStats {
    pub(crate) fn from_session(session: &ClientSession) -> Self {
        Self {
            id: session.id,
            uuid: session.uuid.to_string(),
            address: session.address.to_string(),
            display_name: session.display_name(),
            has_received_first_packets: session.has_received_first_packets(),
            num_avatars_sent_last_frame: session.num_avatars_sent_last_frame(),
            full_rate_distance: session.full_rate_distance(),
            max_full_rate_distance: session.max_full_rate_distance(),
            identity_change_timestamp: session.identity_change_timestamp(),
            billboard_change_timestamp: session.billboard_change_timestamp(),
            packets_received: session.packets_received(),
            bytes_received: session.bytes_received(),
            parse_errors: session.parse_errors(),
        }
    }
}

/// Point-in-time view of the mixer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixerSnapshot {
    pub active_session_count: usize,
    pub pending_removal_count: usize,
    pub gated_session_count: usize,
    pub tick: u64,
    pub last_tick_duration_us: u64,
    pub delivery_failures: u64,
    pub budget_exhaustions: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub sent_last_frame: SentDistribution,
    pub sessions: Vec<SessionStats>,
}

/// Builds [`MixerSnapshot`]s
#[derive(Debug, Clone)]
pub struct StatsReporter {
    registry: Arc<SessionRegistry>,
    mixer: Arc<AvatarMixer>,
}

impl StatsReporter {
    pub fn new(registry: Arc<SessionRegistry>, mixer: Arc<AvatarMixer>) -> Self {
        Self { registry, mixer }
    }

    /// Take a snapshot
    pub fn snapshot(&self) -> MixerSnapshot {
        let mut sessions = Vec::with_capacity(self.registry.count());
        self.registry
            .for_each(|session| sessions.push(SessionStats::from_session(session)));
        sessions.sort_by_key(|session| session.id);

        let counts: Vec<u32> = sessions
            .iter()
            .map(|session| session.num_avatars_sent_last_frame)
            .collect();
        let metrics = self.mixer.metrics();

        MixerSnapshot {
            active_session_count: sessions.len(),
            pending_removal_count: self.registry.pending_removal_count(),
            gated_session_count: sessions
                .iter()
                .filter(|session| !session.has_received_first_packets)
                .count(),
            tick: metrics.ticks(),
            last_tick_duration_us: metrics.last_tick_duration_us(),
            delivery_failures: metrics.delivery_failures(),
            budget_exhaustions: metrics.budget_exhaustions(),
            packets_sent: metrics.packets_sent(),
            bytes_sent: metrics.bytes_sent(),
            sent_last_frame: SentDistribution::from_counts(&counts),
            sessions,
        }
    }
}
