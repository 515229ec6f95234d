//! Datagram handler module
//!
//! Inbound side of the UDP front end:
//! - Admission of unknown peers on their first datagram
//! - Routing each datagram to the mixer as one packet
//! - Periodic idle sweep that disconnects silent peers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::ParseError;
use crate::mixer::{AvatarMixer, PacketDisposition};
use crate::net::buffer::MAX_PACKET_SIZE;
use crate::session::SessionRegistry;

/// Routes inbound datagrams to sessions
pub struct DatagramHandler {
    registry: Arc<SessionRegistry>,
    mixer: Arc<AvatarMixer>,
}

impl DatagramHandler {
    pub fn new(registry: Arc<SessionRegistry>, mixer: Arc<AvatarMixer>) -> Self {
        Self { registry, mixer }
    }

    /// Handle one datagram from `address`. Returns `None` when the peer was
    /// refused admission.
    pub fn handle_datagram(
        &self,
        address: SocketAddr,
        data: &[u8],
    ) -> Option<Result<PacketDisposition, ParseError>> {
        let session = match self.registry.connect(address) {
            Ok(session) => session,
            Err(e) => {
                debug!(address = %address, error = %e, "Dropping datagram from refused peer");
                return None;
            }
        };

        session.touch();
        session.record_packet(data.len());

        let result = self.mixer.handle_packet(session.id, data);
        match &result {
            Ok(PacketDisposition::Applied { bytes_consumed, joined }) => {
                trace!(
                    session_id = session.id,
                    bytes = bytes_consumed,
                    joined = joined,
                    "Packet applied"
                );
            }
            Ok(PacketDisposition::SessionGone) => {
                trace!(session_id = session.id, "Session removed before packet applied");
            }
            Err(e) => {
                debug!(
                    session_id = session.id,
                    address = %address,
                    error = %e,
                    "Dropping malformed packet"
                );
            }
        }
        Some(result)
    }

    /// Receive datagrams until shutdown
    pub async fn run(&self, socket: Arc<UdpSocket>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            address = ?socket.local_addr().ok(),
            "Starting UDP receiver"
        );

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, address)) => {
                            self.handle_datagram(address, &buf[..len]);
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to receive datagram");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("UDP receiver shutting down");
                    break;
                }
            }
        }
    }
}

/// Disconnect idle sessions every `period` until shutdown
pub async fn run_idle_sweep(
    registry: Arc<SessionRegistry>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut sweep_interval = interval(period);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sweep_interval.tick() => {
                let removed = registry.cleanup_idle();
                if !removed.is_empty() {
                    info!(count = removed.len(), "Disconnected idle sessions");
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}
