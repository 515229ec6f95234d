//! Per-participant session data
//!
//! A [`ClientSession`] holds one participant's latest avatar state, the
//! first-packets gate, change timestamps, and the bookkeeping the mixer keeps
//! when that participant acts as an observer.
//!
//! Locking rules:
//! - Avatar state is written only by packets from this participant, one
//!   packet per critical section.
//! - Delivery records are touched only by the tick (and removal/join purges).
//! - Everything else is atomics or small locks read by the stats surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use glam::Vec3;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::avatar::{AvatarData, AvatarDataUpdate, AvatarIdentity, Billboard};
use crate::error::ParseError;

/// Unique session identifier, never reused within a process
pub type SessionId = u64;

/// Current wall-clock time in microseconds since the Unix epoch
pub fn usec_timestamp_now() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Next change stamp: the current time, but always past the previous stamp
fn next_stamp(previous: u64, now: u64) -> u64 {
    now.max(previous + 1)
}

/// What an observer has already been sent about one candidate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryRecord {
    /// Identity stamp of the last identity delivered
    pub identity_timestamp: u64,
    /// Billboard stamp of the last billboard delivered
    pub billboard_timestamp: u64,
    /// Tick on which a pose was last delivered
    pub last_pose_tick: Option<u64>,
}

/// Everything a single packet may change, guarded by one lock
#[derive(Debug, Default)]
struct AvatarState {
    data: AvatarData,
    identity: Option<AvatarIdentity>,
    billboard: Option<Billboard>,
    identity_change_timestamp: u64,
    billboard_change_timestamp: u64,
    has_avatar_data: bool,
    has_identity: bool,
}

/// Consistent copy of a session's avatar state, taken under one read lock
#[derive(Debug, Clone)]
pub struct AvatarSnapshot {
    pub data: AvatarData,
    pub identity: Option<AvatarIdentity>,
    pub billboard: Option<Billboard>,
    pub identity_change_timestamp: u64,
    pub billboard_change_timestamp: u64,
}

/// A connected participant
pub struct ClientSession {
    /// Unique session identifier
    pub id: SessionId,
    /// Public avatar identifier relayed to other participants
    pub uuid: Uuid,
    /// Remote address of the client
    pub address: SocketAddr,
    /// Avatar state written by this participant's packets
    state: RwLock<AvatarState>,
    /// First-packets gate
    has_received_first_packets: AtomicBool,
    /// Set once the session is disconnected; it is then skipped by ticks
    removed: AtomicBool,
    /// Largest distance at which some observer granted full rate last tick
    full_rate_distance: RwLock<f32>,
    /// Full-rate threshold applied when this session observes others
    max_full_rate_distance: RwLock<f32>,
    /// Candidates included in this session's payload last tick
    num_avatars_sent_last_frame: AtomicU32,
    /// Per-candidate delivery bookkeeping for this session as observer
    deliveries: Mutex<HashMap<SessionId, DeliveryRecord>>,
    /// Time of session creation
    pub created_at: Instant,
    /// Time of last inbound packet
    last_activity: RwLock<Instant>,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    parse_errors: AtomicU64,
}

impl ClientSession {
    /// Create a new session
    pub fn new(id: SessionId, address: SocketAddr, max_full_rate_distance: f32) -> Self {
        let now = Instant::now();
        Self {
            id,
            uuid: Uuid::new_v4(),
            address,
            state: RwLock::new(AvatarState::default()),
            has_received_first_packets: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            full_rate_distance: RwLock::new(f32::MAX),
            max_full_rate_distance: RwLock::new(max_full_rate_distance),
            num_avatars_sent_last_frame: AtomicU32::new(0),
            deliveries: Mutex::new(HashMap::new()),
            created_at: now,
            last_activity: RwLock::new(now),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        }
    }

    // ============ Packet application ============

    /// Apply a decoded avatar-data packet as one atomic update
    pub fn apply_avatar_data(&self, update: AvatarDataUpdate) -> Result<(), ParseError> {
        let mut state = self.state.write();
        state.data.apply(update)?;
        state.has_avatar_data = true;
        Ok(())
    }

    /// Apply a decoded identity. Returns whether the identity changed.
    pub fn apply_identity(&self, identity: AvatarIdentity, now: u64) -> bool {
        let mut state = self.state.write();
        state.has_identity = true;
        if state.identity.as_ref() == Some(&identity) {
            return false;
        }
        state.identity = Some(identity);
        state.identity_change_timestamp = next_stamp(state.identity_change_timestamp, now);
        true
    }

    /// Apply a decoded billboard. Returns whether the billboard changed.
    pub fn apply_billboard(&self, billboard: Billboard, now: u64) -> bool {
        let mut state = self.state.write();
        state.has_identity = true;
        if state.billboard.as_ref() == Some(&billboard) {
            return false;
        }
        state.billboard = Some(billboard);
        state.billboard_change_timestamp = next_stamp(state.billboard_change_timestamp, now);
        true
    }

    /// Force every observer's cached identity for this avatar to be stale
    pub fn touch_identity(&self, now: u64) {
        let mut state = self.state.write();
        if state.identity.is_some() {
            state.identity_change_timestamp = next_stamp(state.identity_change_timestamp, now);
        }
    }

    // ============ First-packets gate ============

    /// Whether both an avatar-data and an identity/billboard packet have been
    /// applied
    pub fn has_first_packet_halves(&self) -> bool {
        let state = self.state.read();
        state.has_avatar_data && state.has_identity
    }

    /// Open the first-packets gate if both halves have arrived.
    ///
    /// Returns `true` only for the single call that performs the
    /// false-to-true transition.
    pub fn check_and_set_has_received_first_packets(&self) -> bool {
        if !self.has_first_packet_halves() {
            return false;
        }
        self.has_received_first_packets
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether this session may be relayed to others
    pub fn has_received_first_packets(&self) -> bool {
        self.has_received_first_packets.load(Ordering::Acquire)
    }

    // ============ State accessors ============

    /// Take a consistent copy of the avatar state
    pub fn snapshot(&self) -> AvatarSnapshot {
        let state = self.state.read();
        AvatarSnapshot {
            data: state.data.clone(),
            identity: state.identity.clone(),
            billboard: state.billboard.clone(),
            identity_change_timestamp: state.identity_change_timestamp,
            billboard_change_timestamp: state.billboard_change_timestamp,
        }
    }

    /// Current avatar position
    pub fn position(&self) -> Vec3 {
        self.state.read().data.position
    }

    /// Copy of the current pose
    pub fn avatar(&self) -> AvatarData {
        self.state.read().data.clone()
    }

    /// Display name from the latest identity, if any
    pub fn display_name(&self) -> Option<String> {
        self.state
            .read()
            .identity
            .as_ref()
            .map(|identity| identity.display_name.clone())
    }

    pub fn identity_change_timestamp(&self) -> u64 {
        self.state.read().identity_change_timestamp
    }

    pub fn billboard_change_timestamp(&self) -> u64 {
        self.state.read().billboard_change_timestamp
    }

    pub fn full_rate_distance(&self) -> f32 {
        *self.full_rate_distance.read()
    }

    pub fn set_full_rate_distance(&self, distance: f32) {
        *self.full_rate_distance.write() = distance;
    }

    pub fn max_full_rate_distance(&self) -> f32 {
        *self.max_full_rate_distance.read()
    }

    pub fn set_max_full_rate_distance(&self, distance: f32) {
        *self.max_full_rate_distance.write() = distance;
    }

    // ============ Per-tick counters ============

    pub fn reset_num_avatars_sent_last_frame(&self) {
        self.num_avatars_sent_last_frame.store(0, Ordering::Release);
    }

    pub fn increase_num_avatars_sent_last_frame(&self) {
        self.num_avatars_sent_last_frame
            .fetch_add(1, Ordering::AcqRel);
    }

    pub fn num_avatars_sent_last_frame(&self) -> u32 {
        self.num_avatars_sent_last_frame.load(Ordering::Acquire)
    }

    // ============ Delivery bookkeeping ============

    /// Copy of this observer's delivery records
    pub fn delivery_records(&self) -> HashMap<SessionId, DeliveryRecord> {
        self.deliveries.lock().clone()
    }

    /// Record what was successfully handed to the transport this tick
    pub fn commit_deliveries(&self, records: impl IntoIterator<Item = (SessionId, DeliveryRecord)>) {
        let mut deliveries = self.deliveries.lock();
        for (candidate, record) in records {
            deliveries.insert(candidate, record);
        }
    }

    /// Drop the record for a candidate. Safe if no record exists; returns
    /// whether one did.
    pub fn forget_candidate(&self, candidate: SessionId) -> bool {
        self.deliveries.lock().remove(&candidate).is_some()
    }

    // ============ Lifecycle ============

    /// Tombstone the session. Returns `false` if it was already removed.
    pub fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    /// Check if the session has been disconnected
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Update the last activity timestamp
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Get the last activity time
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    /// Check if the session has been idle too long
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.last_activity().elapsed() > max_idle
    }

    // ============ Diagnostics ============

    pub fn record_packet(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("address", &self.address)
            .field("has_received_first_packets", &self.has_received_first_packets())
            .field("removed", &self.is_removed())
            .field("num_avatars_sent_last_frame", &self.num_avatars_sent_last_frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::avatar::{HeadPose, JointUpdate};
    use bytes::Bytes;
    use glam::Quat;

    fn test_session() -> ClientSession {
        ClientSession::new(1, "127.0.0.1:40000".parse().unwrap(), 10.0)
    }

    fn update_at(position: Vec3) -> AvatarDataUpdate {
        AvatarDataUpdate {
            position,
            orientation: Quat::IDENTITY,
            scale: 1.0,
            head: HeadPose::default(),
            look_at: None,
            audio_loudness: 0.0,
            hand_state: 0,
            key_state: 0,
            joints: JointUpdate::Unchanged,
        }
    }

    fn identity(name: &str) -> AvatarIdentity {
        AvatarIdentity {
            display_name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_gate_requires_both_halves() {
        let session = test_session();
        assert!(!session.check_and_set_has_received_first_packets());

        session.apply_avatar_data(update_at(Vec3::ZERO)).unwrap();
        assert!(!session.check_and_set_has_received_first_packets());
        assert!(!session.has_received_first_packets());

        session.apply_identity(identity("alice"), 100);
        assert!(session.check_and_set_has_received_first_packets());
        assert!(session.has_received_first_packets());
    }

    #[test]
    fn test_check_and_set_transitions_once() {
        let session = test_session();
        session.apply_avatar_data(update_at(Vec3::ZERO)).unwrap();
        session.apply_billboard(Billboard(Bytes::from_static(b"png")), 100);

        assert!(session.check_and_set_has_received_first_packets());
        assert!(!session.check_and_set_has_received_first_packets());
        assert!(session.has_received_first_packets());
    }

    #[test]
    fn test_check_and_set_is_atomic_across_threads() {
        let session = Arc::new(test_session());
        session.apply_avatar_data(update_at(Vec3::ZERO)).unwrap();
        session.apply_identity(identity("alice"), 100);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.check_and_set_has_received_first_packets())
            })
            .collect();
        let transitions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|performed| *performed)
            .count();

        assert_eq!(transitions, 1);
    }

    #[test]
    fn test_identity_timestamp_moves_only_on_change() {
        let session = test_session();

        assert!(session.apply_identity(identity("alice"), 100));
        assert_eq!(session.identity_change_timestamp(), 100);

        assert!(!session.apply_identity(identity("alice"), 200));
        assert_eq!(session.identity_change_timestamp(), 100);

        // Same microsecond still produces a newer stamp
        assert!(session.apply_identity(identity("bob"), 100));
        assert_eq!(session.identity_change_timestamp(), 101);
    }

    #[test]
    fn test_failed_update_leaves_state_untouched() {
        let session = test_session();
        session.apply_avatar_data(update_at(Vec3::X)).unwrap();

        let mut bad = update_at(Vec3::Y);
        bad.joints = JointUpdate::Partial(vec![(4, Quat::IDENTITY)]);
        assert!(session.apply_avatar_data(bad).is_err());

        assert_eq!(session.position(), Vec3::X);
    }

    #[test]
    fn test_sent_counter() {
        let session = test_session();
        session.increase_num_avatars_sent_last_frame();
        session.increase_num_avatars_sent_last_frame();
        assert_eq!(session.num_avatars_sent_last_frame(), 2);

        session.reset_num_avatars_sent_last_frame();
        assert_eq!(session.num_avatars_sent_last_frame(), 0);
    }

    #[test]
    fn test_delivery_records() {
        let session = test_session();
        let record = DeliveryRecord {
            identity_timestamp: 5,
            billboard_timestamp: 0,
            last_pose_tick: Some(3),
        };
        session.commit_deliveries([(2, record)]);

        assert_eq!(session.delivery_records().get(&2), Some(&record));
        assert!(session.forget_candidate(2));
        assert!(!session.forget_candidate(2));
    }

    #[test]
    fn test_mark_removed_once() {
        let session = test_session();
        assert!(!session.is_removed());
        assert!(session.mark_removed());
        assert!(!session.mark_removed());
        assert!(session.is_removed());
    }
}
