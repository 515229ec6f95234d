//! Mixer tick
//!
//! The per-tick orchestrator. Each tick:
//! 1. Captures the active set at the membership boundary
//! 2. Resets every session's sent counter
//! 3. Encodes each relayable candidate once from a consistent snapshot
//! 4. For every observer (in parallel), consults the interest manager against
//!    every candidate, assembles a budgeted payload and hands it to the
//!    transport
//! 5. Commits delivery bookkeeping for observers whose payload went out
//!
//! Inbound packets are applied concurrently through [`AvatarMixer::handle_packet`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rayon::prelude::*;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::interest::{CandidateView, DecimationPolicy, InterestManager, ObserverView};
use super::payload::{AssembledPayload, BudgetExhausted, Inclusion, PayloadAssembler};
use crate::config::MixerConfig;
use crate::error::{DeliveryError, ParseError};
use crate::protocol::{CandidateRecords, Fidelity, PacketParser};
use crate::session::{
    usec_timestamp_now, ClientSession, DeliveryRecord, SessionId, SessionListener,
    SessionRegistry,
};

/// Outbound side of the transport
pub trait Transport: Send + Sync {
    /// Queue one packet for a session. Must not block.
    fn send(&self, session_id: SessionId, packet: Bytes) -> Result<(), DeliveryError>;
}

/// Tick tuning
#[derive(Debug, Clone)]
pub struct MixerSettings {
    /// Largest outbound packet
    pub max_packet_size: usize,
    /// Pose and identity bytes allowed per observer per tick
    pub payload_budget_bytes: usize,
    /// Wall-clock allowance for one observer's assembly
    pub max_assembly_time: Option<Duration>,
    /// Reduced-rate schedule
    pub decimation: DecimationPolicy,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            max_packet_size: 1450,
            payload_budget_bytes: 6000,
            max_assembly_time: Some(Duration::from_micros(2000)),
            decimation: DecimationPolicy::default(),
        }
    }
}

impl From<&MixerConfig> for MixerSettings {
    fn from(config: &MixerConfig) -> Self {
        Self {
            max_packet_size: config.max_packet_size,
            payload_budget_bytes: config.payload_budget_bytes,
            max_assembly_time: (config.max_assembly_time_us > 0)
                .then(|| Duration::from_micros(config.max_assembly_time_us)),
            decimation: config.decimation,
        }
    }
}

/// What happened to an inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    /// Applied to the session
    Applied {
        bytes_consumed: usize,
        /// This packet completed the first-packets gate
        joined: bool,
    },
    /// The session no longer exists; the packet was dropped
    SessionGone,
}

/// One observer's share of a tick
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverReport {
    pub observer: SessionId,
    pub included: Vec<Inclusion>,
    pub killed: Vec<SessionId>,
    pub packets: usize,
    pub bytes: usize,
    pub delivered: bool,
    pub exhausted: Option<BudgetExhausted>,
}

impl ObserverReport {
    /// IDs of the candidates in this observer's payload, nearest first
    pub fn included_ids(&self) -> Vec<SessionId> {
        self.included.iter().map(|inclusion| inclusion.candidate).collect()
    }

    pub fn inclusion(&self, candidate: SessionId) -> Option<&Inclusion> {
        self.included
            .iter()
            .find(|inclusion| inclusion.candidate == candidate)
    }
}

/// Result of one tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub observers: Vec<ObserverReport>,
    pub duration: Duration,
}

impl TickReport {
    pub fn observer(&self, id: SessionId) -> Option<&ObserverReport> {
        self.observers.iter().find(|report| report.observer == id)
    }
}

/// Tick counters for the stats surface
#[derive(Debug, Default)]
pub struct TickMetrics {
    ticks: AtomicU64,
    last_tick_duration_us: AtomicU64,
    delivery_failures: AtomicU64,
    budget_exhaustions: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl TickMetrics {
    /// Ticks started so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn last_tick_duration_us(&self) -> u64 {
        self.last_tick_duration_us.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn budget_exhaustions(&self) -> u64 {
        self.budget_exhaustions.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

/// Removed sessions waiting for their kill notices to go out
#[derive(Debug, Default)]
struct KillQueue {
    pending: Mutex<Vec<(SessionId, Uuid)>>,
}

impl KillQueue {
    fn drain(&self) -> Vec<(SessionId, Uuid)> {
        let mut kills = std::mem::take(&mut *self.pending.lock());
        kills.sort_unstable_by_key(|&(id, _)| id);
        kills.dedup_by_key(|&mut (id, _)| id);
        kills
    }

    /// Queue kills again for the next tick
    fn requeue(&self, kills: impl IntoIterator<Item = (SessionId, Uuid)>) {
        self.pending.lock().extend(kills);
    }
}

impl SessionListener for KillQueue {
    fn session_removed(&self, session: &ClientSession) {
        self.pending.lock().push((session.id, session.uuid));
    }
}

/// A relayable candidate for the current tick
struct Candidate {
    view: CandidateView,
    records: CandidateRecords,
}

/// The avatar mixer
pub struct AvatarMixer {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    interest: InterestManager,
    settings: MixerSettings,
    kills: Arc<KillQueue>,
    tick_lock: Mutex<()>,
    metrics: TickMetrics,
}

impl AvatarMixer {
    /// Create a mixer over `registry`, delivering through `transport`
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        settings: MixerSettings,
    ) -> Self {
        let kills = Arc::new(KillQueue::default());
        registry.subscribe(kills.clone());

        Self {
            registry,
            transport,
            interest: InterestManager::new(settings.decimation),
            settings,
            kills,
            tick_lock: Mutex::new(()),
            metrics: TickMetrics::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &MixerSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    // ============ Inbound ============

    /// Apply an inbound payload from `session_id`
    pub fn handle_packet(
        &self,
        session_id: SessionId,
        data: &[u8],
    ) -> Result<PacketDisposition, ParseError> {
        let session = match self.registry.get(session_id) {
            Some(session) => session,
            None => return Ok(PacketDisposition::SessionGone),
        };

        let outcome = PacketParser::parse(&session, data)?;

        let joined = session.check_and_set_has_received_first_packets();
        if joined {
            self.on_fully_joined(&session);
        }

        Ok(PacketDisposition::Applied {
            bytes_consumed: outcome.bytes_consumed,
            joined,
        })
    }

    /// One-time side effect when a session becomes relayable: every
    /// observer's view of it starts from scratch
    fn on_fully_joined(&self, session: &ClientSession) {
        session.touch_identity(usec_timestamp_now());
        self.registry.for_each(|observer| {
            observer.forget_candidate(session.id);
        });
        info!(
            session_id = session.id,
            uuid = %session.uuid,
            display_name = ?session.display_name(),
            "Participant fully joined"
        );
    }

    // ============ Tick ============

    /// Run one tick to completion
    pub fn run_tick(&self) -> TickReport {
        let _guard = self.tick_lock.lock();
        let started = Instant::now();
        let tick = self.metrics.ticks.fetch_add(1, Ordering::AcqRel);

        let active = self.registry.begin_tick();
        let kills = self.kills.drain();

        for session in &active {
            session.reset_num_avatars_sent_last_frame();
        }

        let candidates: Vec<Candidate> = active
            .par_iter()
            .filter(|session| session.has_received_first_packets())
            .map(|session| {
                let snapshot = session.snapshot();
                Candidate {
                    view: CandidateView {
                        id: session.id,
                        position: snapshot.data.position,
                        has_received_first_packets: true,
                        identity_timestamp: snapshot.identity_change_timestamp,
                        billboard_timestamp: snapshot.billboard_change_timestamp,
                    },
                    records: CandidateRecords::encode(session.id, session.uuid, &snapshot),
                }
            })
            .collect();

        let observers: Vec<ObserverReport> = active
            .par_iter()
            .filter(|observer| !observer.is_removed())
            .map(|observer| self.mix_for_observer(observer, &candidates, &kills, tick))
            .collect();

        self.update_full_rate_distances(&active, &observers);

        self.registry.end_tick();

        let duration = started.elapsed();
        self.metrics
            .last_tick_duration_us
            .store(duration.as_micros() as u64, Ordering::Relaxed);

        if tick % 1000 == 0 {
            debug!(
                tick = tick,
                sessions = active.len(),
                candidates = candidates.len(),
                duration_us = duration.as_micros() as u64,
                "Mixer tick milestone"
            );
        }

        TickReport {
            tick,
            observers,
            duration,
        }
    }

    fn mix_for_observer(
        &self,
        observer: &ClientSession,
        candidates: &[Candidate],
        kills: &[(SessionId, Uuid)],
        tick: u64,
    ) -> ObserverReport {
        let view = ObserverView {
            id: observer.id,
            position: observer.position(),
            max_full_rate_distance: observer.max_full_rate_distance(),
        };
        let records = observer.delivery_records();
        let deadline = self
            .settings
            .max_assembly_time
            .map(|allowance| Instant::now() + allowance);
        let mut assembler = PayloadAssembler::new(
            self.settings.max_packet_size,
            self.settings.payload_budget_bytes,
            deadline,
        );

        for &(candidate, uuid) in kills {
            if records.contains_key(&candidate) {
                assembler.add_kill(candidate, uuid);
            }
        }

        let mut decisions: Vec<_> = candidates
            .iter()
            .filter_map(|candidate| {
                self.interest
                    .evaluate(&view, &candidate.view, records.get(&candidate.view.id), tick)
                    .map(|decision| (candidate, decision))
            })
            .collect();
        decisions.sort_by(|(a, da), (b, db)| {
            da.distance
                .total_cmp(&db.distance)
                .then(a.view.id.cmp(&b.view.id))
        });

        for (candidate, decision) in &decisions {
            if !assembler.offer(&candidate.records, decision) {
                break;
            }
        }

        let payload = assembler.finish();
        if let Some(reason) = payload.exhausted {
            self.metrics.budget_exhaustions.fetch_add(1, Ordering::Relaxed);
            trace!(
                session_id = observer.id,
                reason = ?reason,
                included = payload.included.len(),
                offered = decisions.len(),
                "Payload budget exhausted"
            );
        }

        let delivered = self.deliver(observer.id, &payload);
        if delivered {
            self.commit(observer, &records, &payload, tick);
            for &candidate in &payload.killed {
                observer.forget_candidate(candidate);
            }
        } else {
            observer.reset_num_avatars_sent_last_frame();
            // Observers that already forgot the avatar skip the retry
            self.kills.requeue(
                kills
                    .iter()
                    .filter(|(candidate, _)| payload.killed.contains(candidate))
                    .copied(),
            );
        }

        ObserverReport {
            observer: observer.id,
            packets: payload.packets.len(),
            bytes: payload.bytes,
            included: payload.included,
            killed: payload.killed,
            delivered,
            exhausted: payload.exhausted,
        }
    }

    /// Hand every packet to the transport. Stops at the first failure.
    fn deliver(&self, session_id: SessionId, payload: &AssembledPayload) -> bool {
        for packet in &payload.packets {
            if let Err(e) = self.transport.send(session_id, packet.clone()) {
                self.metrics.delivery_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = session_id,
                    error = %e,
                    "Failed to deliver payload, skipping observer this tick"
                );
                return false;
            }
            self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .bytes_sent
                .fetch_add(packet.len() as u64, Ordering::Relaxed);
        }
        true
    }

    fn commit(
        &self,
        observer: &ClientSession,
        records: &HashMap<SessionId, DeliveryRecord>,
        payload: &AssembledPayload,
        tick: u64,
    ) {
        let updates: Vec<(SessionId, DeliveryRecord)> = payload
            .included
            .iter()
            .map(|inclusion| {
                observer.increase_num_avatars_sent_last_frame();

                let mut record = records
                    .get(&inclusion.candidate)
                    .copied()
                    .unwrap_or_default();
                if let Some(stamp) = inclusion.identity_timestamp {
                    record.identity_timestamp = stamp;
                }
                if let Some(stamp) = inclusion.billboard_timestamp {
                    record.billboard_timestamp = stamp;
                }
                if inclusion.pose.is_some() {
                    record.last_pose_tick = Some(tick);
                }
                (inclusion.candidate, record)
            })
            .collect();
        observer.commit_deliveries(updates);
    }

    /// Record, per candidate, the largest full-rate threshold under which
    /// some observer sent it a full pose this tick
    fn update_full_rate_distances(
        &self,
        active: &[Arc<ClientSession>],
        observers: &[ObserverReport],
    ) {
        let thresholds: HashMap<SessionId, f32> = active
            .iter()
            .map(|session| (session.id, session.max_full_rate_distance()))
            .collect();

        let mut granted: HashMap<SessionId, f32> = HashMap::new();
        for report in observers.iter().filter(|report| report.delivered) {
            let threshold = thresholds.get(&report.observer).copied().unwrap_or(0.0);
            for inclusion in &report.included {
                if inclusion.pose == Some(Fidelity::Full) {
                    let entry = granted.entry(inclusion.candidate).or_insert(0.0);
                    *entry = entry.max(threshold);
                }
            }
        }

        for session in active {
            session.set_full_rate_distance(granted.get(&session.id).copied().unwrap_or(0.0));
        }
    }

    // ============ Loop ============

    /// Run the tick loop until shutdown. A tick in progress always finishes.
    pub async fn run(self: Arc<Self>, tick_rate_hz: u32, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = Duration::from_secs_f64(1.0 / tick_rate_hz.max(1) as f64);
        info!(
            tick_rate_hz = tick_rate_hz,
            period_us = period.as_micros() as u64,
            max_packet_size = self.settings.max_packet_size,
            payload_budget_bytes = self.settings.payload_budget_bytes,
            "Starting mixer tick loop"
        );

        let mut tick_interval = interval(period);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let mixer = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || mixer.run_tick()).await {
                        error!(error = %e, "Mixer tick panicked");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        info!(total_ticks = self.metrics.ticks(), "Mixer tick loop stopped");
    }
}

impl std::fmt::Debug for AvatarMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvatarMixer")
            .field("sessions", &self.registry.count())
            .field("ticks", &self.metrics.ticks())
            .field("settings", &self.settings)
            .finish()
    }
}
