//! Payload assembly
//!
//! Packs one observer's records for a tick into packets no larger than the
//! configured packet size, under a per-tick byte budget and a wall-clock
//! deadline. Candidates are offered nearest first; the first one that does
//! not fit ends the tick for that observer.
//!
//! A record that could never fit the budget does not block the observer: a
//! full pose drops to reduced fidelity, and whatever is still larger than the
//! whole budget is sent anyway and ends the tick after it.
//!
//! Billboards are large and rare, so they do not count against the byte
//! budget; at most one is sent per observer per tick and the rest wait for a
//! later tick.

use std::time::Instant;

use bytes::Bytes;
use uuid::Uuid;

use super::interest::InterestDecision;
use crate::net::buffer::PacketBuffer;
use crate::protocol::encoder::encode_kill_record;
use crate::protocol::packets::{write_header, PacketType, HEADER_SIZE};
use crate::protocol::{CandidateRecords, Fidelity};
use crate::session::SessionId;

/// Why an observer's payload stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExhausted {
    Bytes,
    Time,
}

/// Accumulates records of one packet type into size-limited packets
#[derive(Debug)]
struct PacketWriter {
    packet_type: PacketType,
    max_packet_size: usize,
    current: PacketBuffer,
    packets: Vec<Bytes>,
}

impl PacketWriter {
    fn new(packet_type: PacketType, max_packet_size: usize) -> Self {
        Self {
            packet_type,
            max_packet_size,
            current: PacketBuffer::new(),
            packets: Vec::new(),
        }
    }

    /// Append a record, starting a new packet if it would overflow. A record
    /// larger than a packet goes alone in its own packet.
    fn push(&mut self, record: &[u8]) {
        if !self.current.is_empty() && self.current.len() + record.len() > self.max_packet_size {
            self.flush();
        }
        if self.current.is_empty() {
            write_header(&mut self.current, self.packet_type);
        }
        self.current.write_bytes(record);
    }

    fn flush(&mut self) {
        if self.current.len() > HEADER_SIZE {
            let packet = std::mem::take(&mut self.current);
            self.packets.push(packet.freeze());
        } else {
            self.current.clear();
        }
    }

    fn finish(mut self) -> Vec<Bytes> {
        self.flush();
        self.packets
    }
}

/// One candidate as it went into the payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inclusion {
    pub candidate: SessionId,
    pub pose: Option<Fidelity>,
    pub identity_timestamp: Option<u64>,
    pub billboard_timestamp: Option<u64>,
    pub distance: f32,
}

/// Packets and bookkeeping produced for one observer
#[derive(Debug, Default)]
pub struct AssembledPayload {
    pub packets: Vec<Bytes>,
    pub included: Vec<Inclusion>,
    pub killed: Vec<SessionId>,
    pub bytes: usize,
    pub exhausted: Option<BudgetExhausted>,
}

/// Budgeted builder for one observer's payload
#[derive(Debug)]
pub struct PayloadAssembler {
    kills: PacketWriter,
    identities: PacketWriter,
    billboards: PacketWriter,
    poses: PacketWriter,
    byte_budget: usize,
    deadline: Option<Instant>,
    bytes_used: usize,
    billboard_sent: bool,
    included: Vec<Inclusion>,
    killed: Vec<SessionId>,
    exhausted: Option<BudgetExhausted>,
}

impl PayloadAssembler {
    pub fn new(max_packet_size: usize, byte_budget: usize, deadline: Option<Instant>) -> Self {
        Self {
            kills: PacketWriter::new(PacketType::KillAvatar, max_packet_size),
            identities: PacketWriter::new(PacketType::RelayedIdentity, max_packet_size),
            billboards: PacketWriter::new(PacketType::RelayedBillboard, max_packet_size),
            poses: PacketWriter::new(PacketType::BulkAvatarData, max_packet_size),
            byte_budget,
            deadline,
            bytes_used: 0,
            billboard_sent: false,
            included: Vec::new(),
            killed: Vec::new(),
            exhausted: None,
        }
    }

    /// Tell the observer an avatar is gone. Not budgeted.
    pub fn add_kill(&mut self, candidate: SessionId, uuid: Uuid) {
        self.kills.push(&encode_kill_record(uuid));
        self.killed.push(candidate);
    }

    /// Offer a candidate. Returns `false` once the budget is spent; the
    /// candidate and everything after it are skipped.
    pub fn offer(&mut self, records: &CandidateRecords, decision: &InterestDecision) -> bool {
        if self.exhausted.is_some() {
            return false;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.exhausted = Some(BudgetExhausted::Time);
                return false;
            }
        }

        let identity = records.identity.as_ref().filter(|_| decision.send_identity);
        let billboard = records
            .billboard
            .as_ref()
            .filter(|_| decision.send_billboard && !self.billboard_sent);

        let mut fidelity = decision.pose;
        if fidelity == Some(Fidelity::Full)
            && budgeted_len(records, fidelity, identity) > self.byte_budget
        {
            fidelity = Some(Fidelity::Reduced);
        }
        let pose = fidelity.map(|fidelity| records.pose(fidelity));
        let cost = budgeted_len(records, fidelity, identity);
        let oversized = cost > self.byte_budget;

        if !oversized && self.bytes_used + cost > self.byte_budget {
            self.exhausted = Some(BudgetExhausted::Bytes);
            return false;
        }

        if pose.is_none() && identity.is_none() && billboard.is_none() {
            // Only a billboard was due and this tick's billboard is taken
            return true;
        }

        if let Some(record) = identity {
            self.identities.push(record);
        }
        if let Some(record) = billboard {
            self.billboards.push(record);
            self.billboard_sent = true;
        }
        if let Some(record) = pose {
            self.poses.push(record);
        }
        self.bytes_used += cost;

        if oversized {
            self.exhausted = Some(BudgetExhausted::Bytes);
        }

        self.included.push(Inclusion {
            candidate: records.id,
            pose: fidelity,
            identity_timestamp: identity.map(|_| records.identity_timestamp),
            billboard_timestamp: billboard.map(|_| records.billboard_timestamp),
            distance: decision.distance,
        });
        true
    }

    /// Bytes charged against the budget so far
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn finish(self) -> AssembledPayload {
        let mut packets = self.kills.finish();
        packets.extend(self.identities.finish());
        packets.extend(self.billboards.finish());
        packets.extend(self.poses.finish());

        AssembledPayload {
            bytes: packets.iter().map(Bytes::len).sum(),
            packets,
            included: self.included,
            killed: self.killed,
            exhausted: self.exhausted,
        }
    }
}

/// Budgeted bytes for a candidate: its pose and identity records
fn budgeted_len(
    records: &CandidateRecords,
    pose: Option<Fidelity>,
    identity: Option<&Bytes>,
) -> usize {
    pose.map_or(0, |fidelity| records.pose(fidelity).len()) + identity.map_or(0, Bytes::len)
}
