//! Integration tests for the relay path
//!
//! These tests drive the mixer end to end through its public API:
//! - Inbound packets applied to sessions and the first-packets gate
//! - Distance-based rates and fidelity across several ticks
//! - Budgets, delivery failures and tick-boundary removals
//! - The packets handed to the transport, decoded as a client would

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Barrier};

use bytes::Bytes;
use glam::{Quat, Vec3};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;

use avatar_mixer::avatar::{AvatarDataUpdate, AvatarIdentity, Billboard, HeadPose, JointUpdate};
use avatar_mixer::mixer::{
    AvatarMixer, BudgetExhausted, MixerSettings, PacketDisposition, TickReport, Transport,
};
use avatar_mixer::protocol::{decode_relayed, Fidelity, IncomingPacket, RelayedPacket};
use avatar_mixer::session::{SessionId, SessionRegistry};
use avatar_mixer::stats::StatsReporter;
use avatar_mixer::DeliveryError;

/// Transport that keeps every packet and can refuse one session. It can
/// also disconnect a session from inside the first send it sees.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(SessionId, Bytes)>>,
    refuse: Mutex<Option<SessionId>>,
    disconnect_on_send: Mutex<Option<(Arc<SessionRegistry>, SessionId)>>,
}

impl RecordingTransport {
    fn take(&self, session_id: SessionId) -> Vec<RelayedPacket> {
        let mut sent = self.sent.lock();
        let (mine, rest): (Vec<_>, Vec<_>) =
            sent.drain(..).partition(|(id, _)| *id == session_id);
        *sent = rest;
        mine.into_iter()
            .map(|(_, packet)| decode_relayed(&packet).unwrap())
            .collect()
    }

    fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, session_id: SessionId, packet: Bytes) -> Result<(), DeliveryError> {
        let pending = self.disconnect_on_send.lock().take();
        if let Some((registry, leaving)) = pending {
            registry.disconnect(leaving);
        }
        if *self.refuse.lock() == Some(session_id) {
            return Err(DeliveryError::QueueFull);
        }
        self.sent.lock().push((session_id, packet));
        Ok(())
    }
}

struct World {
    registry: Arc<SessionRegistry>,
    transport: Arc<RecordingTransport>,
    mixer: Arc<AvatarMixer>,
}

impl World {
    fn new() -> Self {
        Self::with_settings(MixerSettings {
            max_assembly_time: None,
            ..Default::default()
        })
    }

    fn with_settings(settings: MixerSettings) -> Self {
        let registry = Arc::new(SessionRegistry::with_limits(256, 10, 10.0));
        let transport = Arc::new(RecordingTransport::default());
        let mixer = Arc::new(AvatarMixer::new(
            registry.clone(),
            transport.clone(),
            settings,
        ));
        Self {
            registry,
            transport,
            mixer,
        }
    }

    fn connect(&self, port: u16) -> SessionId {
        let address = SocketAddr::from(([127, 0, 0, 1], port));
        assert_ok!(self.registry.connect(address)).id
    }

    /// Connect and send both first packets
    fn join(&self, port: u16, position: Vec3) -> SessionId {
        let id = self.connect(port);
        assert_ok!(self.mixer.handle_packet(id, &pose_at(position)));
        assert_ok!(self
            .mixer
            .handle_packet(id, &identity(&format!("avatar-{port}"))));
        id
    }

    fn tick(&self) -> TickReport {
        self.mixer.run_tick()
    }
}

fn pose_at(position: Vec3) -> Bytes {
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
    .to_bytes()
}

fn identity(name: &str) -> Bytes {
    AvatarIdentity {
        display_name: name.to_string(),
        ..Default::default()
    }
    .to_bytes()
}

fn poses_in(packets: &[RelayedPacket]) -> Vec<(uuid::Uuid, Fidelity)> {
    packets
        .iter()
        .filter_map(|packet| match packet {
            RelayedPacket::Poses(poses) => Some(poses),
            _ => None,
        })
        .flatten()
        .map(|pose| (pose.uuid, pose.fidelity))
        .collect()
}

/// Observer at the origin with candidates at 5m, 40m and 200m: the near
/// one every tick at full fidelity, the others decimated by distance.
#[test]
fn test_update_rates_follow_distance() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    let near = world.join(2, Vec3::new(5.0, 0.0, 0.0));
    let mid = world.join(3, Vec3::new(40.0, 0.0, 0.0));
    let far = world.join(4, Vec3::new(200.0, 0.0, 0.0));

    // Nothing has been sent yet, so every candidate goes out once
    let first = world.tick();
    let report = first.observer(observer).unwrap();
    assert_eq!(report.included_ids(), vec![near, mid, far]);
    assert_eq!(report.inclusion(near).unwrap().pose, Some(Fidelity::Full));
    assert_eq!(report.inclusion(mid).unwrap().pose, Some(Fidelity::Reduced));
    assert_eq!(report.inclusion(far).unwrap().pose, Some(Fidelity::Reduced));

    let mut counts: HashMap<SessionId, usize> = HashMap::new();
    for _ in 0..8 {
        let report = world.tick();
        for inclusion in &report.observer(observer).unwrap().included {
            assert!(inclusion.pose.is_some());
            assert_eq!(inclusion.identity_timestamp, None);
            *counts.entry(inclusion.candidate).or_default() += 1;
        }
    }

    // 30m past the threshold: every 4th tick. 190m past: capped at 8.
    assert_eq!(counts.get(&near).copied(), Some(8));
    assert_eq!(counts.get(&mid).copied(), Some(2));
    assert_eq!(counts.get(&far).copied(), Some(1));
}

#[test]
fn test_relayed_packets_decode() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    let other = world.join(2, Vec3::new(2.0, 0.0, 0.0));
    let other_uuid = world.registry.get(other).unwrap().uuid;

    world.transport.clear();
    world.tick();
    let packets = world.transport.take(observer);

    let identities: Vec<_> = packets
        .iter()
        .filter_map(|packet| match packet {
            RelayedPacket::Identities(identities) => Some(identities.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].0, other_uuid);
    assert_eq!(identities[0].1.display_name, "avatar-2");

    assert_eq!(poses_in(&packets), vec![(other_uuid, Fidelity::Full)]);
}

#[test]
fn test_gate_requires_both_first_packets() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);

    let pose_only = world.connect(2);
    assert_ok!(world.mixer.handle_packet(pose_only, &pose_at(Vec3::X)));
    let identity_only = world.connect(3);
    assert_ok!(world.mixer.handle_packet(identity_only, &identity("shy")));

    let report = world.tick();
    assert!(report.observer(observer).unwrap().included.is_empty());
    // Gated sessions still observe
    assert_eq!(
        report.observer(pose_only).unwrap().included_ids(),
        vec![observer]
    );

    let disposition = assert_ok!(world.mixer.handle_packet(pose_only, &identity("late")));
    assert_eq!(
        disposition,
        PacketDisposition::Applied {
            bytes_consumed: identity("late").len(),
            joined: true,
        }
    );

    let report = world.tick();
    assert_eq!(
        report.observer(observer).unwrap().included_ids(),
        vec![pose_only]
    );
}

#[test]
fn test_concurrent_first_packets_join_once() {
    let world = World::new();

    for port in 0..32 {
        let id = world.connect(1000 + port);
        let barrier = Barrier::new(2);
        let mixer = &world.mixer;

        let joins: Vec<bool> = std::thread::scope(|scope| {
            let pose = scope.spawn(|| {
                barrier.wait();
                mixer.handle_packet(id, &pose_at(Vec3::ZERO)).unwrap()
            });
            let ident = scope.spawn(|| {
                barrier.wait();
                mixer.handle_packet(id, &identity("racer")).unwrap()
            });
            [pose.join().unwrap(), ident.join().unwrap()]
                .into_iter()
                .map(|disposition| {
                    matches!(disposition, PacketDisposition::Applied { joined: true, .. })
                })
                .collect()
        });

        assert_eq!(joins.iter().filter(|joined| **joined).count(), 1);
        assert!(world.registry.get(id).unwrap().has_received_first_packets());
    }
}

#[test]
fn test_identity_change_forces_far_candidate() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    let far = world.join(2, Vec3::new(200.0, 0.0, 0.0));
    world.tick();

    // Find a tick on which the far candidate is not due
    let mut skipped = false;
    for _ in 0..8 {
        if world.tick().observer(observer).unwrap().included.is_empty() {
            skipped = true;
            break;
        }
    }
    assert!(skipped);

    assert_ok!(world.mixer.handle_packet(far, &identity("renamed")));
    let report = world.tick();
    let inclusion = *report.observer(observer).unwrap().inclusion(far).unwrap();
    assert!(inclusion.identity_timestamp.is_some());
    assert_eq!(inclusion.pose, Some(Fidelity::Reduced));
}

#[test]
fn test_billboard_relayed_once() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    let far = world.join(2, Vec3::new(200.0, 0.0, 0.0));
    let far_uuid = world.registry.get(far).unwrap().uuid;
    world.tick();

    let image = Bytes::from_static(b"\x89PNG-thumbnail");
    assert_ok!(world
        .mixer
        .handle_packet(far, &Billboard(image.clone()).to_bytes()));

    world.transport.clear();
    let report = world.tick();
    let inclusion = *report.observer(observer).unwrap().inclusion(far).unwrap();
    assert!(inclusion.billboard_timestamp.is_some());

    let billboards: Vec<_> = world
        .transport
        .take(observer)
        .into_iter()
        .filter_map(|packet| match packet {
            RelayedPacket::Billboards(billboards) => Some(billboards),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(billboards, vec![(far_uuid, image)]);

    let next = world.tick();
    if let Some(inclusion) = next.observer(observer).unwrap().inclusion(far) {
        assert_eq!(inclusion.billboard_timestamp, None);
    }
}

#[test]
fn test_sent_counter_resets_each_tick() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    let a = world.join(2, Vec3::X);
    let b = world.join(3, Vec3::Y);

    world.tick();
    let session = world.registry.get(observer).unwrap();
    assert_eq!(session.num_avatars_sent_last_frame(), 2);

    world.registry.disconnect(a);
    world.registry.disconnect(b);
    world.tick();
    assert_eq!(session.num_avatars_sent_last_frame(), 0);
}

#[test]
fn test_disconnect_mid_tick_applies_at_boundary() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    let leaving = world.join(2, Vec3::X);
    let leaving_uuid = world.registry.get(leaving).unwrap().uuid;
    world.tick();

    // Disconnect while tick T is handing payloads to the transport
    *world.transport.disconnect_on_send.lock() = Some((world.registry.clone(), leaving));
    let during = world.tick();
    assert!(world.transport.disconnect_on_send.lock().is_none());
    assert_eq!(
        during.observer(observer).unwrap().included_ids(),
        vec![leaving]
    );
    assert!(during.observer(observer).unwrap().delivered);
    assert_eq!(world.registry.pending_removal_count(), 0);
    assert_eq!(world.registry.count(), 1);
    assert!(world.registry.get(leaving).is_none());

    // Tick T+1 only tells the observer the avatar is gone
    world.transport.clear();
    let report = world.tick();
    let observed = report.observer(observer).unwrap();
    assert!(observed.included.is_empty());
    assert_eq!(observed.killed, vec![leaving]);
    assert!(report.observer(leaving).is_none());

    let packets = world.transport.take(observer);
    assert_eq!(packets, vec![RelayedPacket::Kills(vec![leaving_uuid])]);
}

#[test]
fn test_kill_survives_failed_delivery() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    let leaving = world.join(2, Vec3::X);
    let leaving_uuid = world.registry.get(leaving).unwrap().uuid;
    world.tick();

    world.registry.disconnect(leaving);
    *world.transport.refuse.lock() = Some(observer);
    let failed = world.tick();
    assert!(!failed.observer(observer).unwrap().delivered);

    *world.transport.refuse.lock() = None;
    world.transport.clear();
    for _ in 0..3 {
        world.tick();
    }
    let packets = world.transport.take(observer);
    assert_eq!(packets, vec![RelayedPacket::Kills(vec![leaving_uuid])]);
}

#[test]
fn test_oversized_skeleton_does_not_block_observer() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    let skeleton = world.connect(2);
    let heavy_pose = AvatarDataUpdate {
        position: Vec3::X,
        orientation: Quat::IDENTITY,
        scale: 1.0,
        head: HeadPose::default(),
        look_at: None,
        audio_loudness: 0.0,
        hand_state: 0,
        key_state: 0,
        joints: JointUpdate::Full(vec![Quat::IDENTITY; 400]),
    }
    .to_bytes();
    assert!(heavy_pose.len() > world.mixer.settings().payload_budget_bytes);
    assert_ok!(world.mixer.handle_packet(skeleton, &heavy_pose));
    assert_ok!(world.mixer.handle_packet(skeleton, &identity("heavy")));
    let near = world.join(3, Vec3::new(2.0, 0.0, 0.0));

    for _ in 0..5 {
        let report = world.tick();
        let observed = report.observer(observer).unwrap();
        assert_eq!(observed.included_ids(), vec![skeleton, near]);
        assert_eq!(
            observed.inclusion(skeleton).unwrap().pose,
            Some(Fidelity::Reduced)
        );
        assert_eq!(observed.inclusion(near).unwrap().pose, Some(Fidelity::Full));
        assert_eq!(observed.exhausted, None);
    }
}

#[test]
fn test_budget_drops_farthest_first() {
    let world = World::with_settings(MixerSettings {
        payload_budget_bytes: 300,
        max_assembly_time: None,
        ..Default::default()
    });
    let observer = world.join(1, Vec3::ZERO);
    let candidates: Vec<SessionId> = (0..6)
        .map(|i| world.join(10 + i, Vec3::new(1.0 + i as f32, 0.0, 0.0)))
        .collect();

    let report = world.tick();
    let observed = report.observer(observer).unwrap();

    assert_eq!(observed.exhausted, Some(BudgetExhausted::Bytes));
    let included = observed.included_ids();
    assert!(!included.is_empty());
    assert!(included.len() < candidates.len());
    assert_eq!(included, candidates[..included.len()].to_vec());
    assert!(world.mixer.metrics().budget_exhaustions() >= 1);
}

#[test]
fn test_delivery_failure_skips_only_that_observer() {
    let world = World::new();
    let a = world.join(1, Vec3::ZERO);
    let b = world.join(2, Vec3::X);
    let c = world.join(3, Vec3::Y);
    *world.transport.refuse.lock() = Some(a);

    let report = world.tick();

    assert!(!report.observer(a).unwrap().delivered);
    assert!(report.observer(b).unwrap().delivered);
    assert!(report.observer(c).unwrap().delivered);
    assert_eq!(world.registry.get(a).unwrap().num_avatars_sent_last_frame(), 0);
    assert_eq!(world.registry.get(b).unwrap().num_avatars_sent_last_frame(), 2);
    assert_eq!(world.mixer.metrics().delivery_failures(), 1);
}

#[test]
fn test_stats_after_ticks() {
    let world = World::new();
    let observer = world.join(1, Vec3::ZERO);
    world.join(2, Vec3::X);
    let lurker = world.connect(3);
    world.tick();

    let stats = StatsReporter::new(world.registry.clone(), world.mixer.clone());
    let snapshot = stats.snapshot();

    assert_eq!(snapshot.active_session_count, 3);
    assert_eq!(snapshot.gated_session_count, 1);
    assert_eq!(snapshot.tick, 1);
    assert!(snapshot.packets_sent > 0);

    let session = snapshot
        .sessions
        .iter()
        .find(|session| session.id == observer)
        .unwrap();
    assert_eq!(session.num_avatars_sent_last_frame, 1);
    assert!(snapshot.sessions.iter().any(|session| session.id == lurker));
}
