//! Application state module
//!
//! Wires the registry, mixer, transport and stats together and holds the
//! shutdown channel shared by every task.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::MixerConfig;
use crate::mixer::{AvatarMixer, MixerSettings};
use crate::net::transport::{Outbound, UdpTransport};
use crate::net::DatagramHandler;
use crate::session::SessionRegistry;
use crate::stats::StatsReporter;

/// Application state shared across all tasks
pub struct AppState {
    /// Mixer configuration
    pub config: MixerConfig,
    /// Active sessions
    pub registry: Arc<SessionRegistry>,
    /// Tick orchestrator
    pub mixer: Arc<AvatarMixer>,
    /// Diagnostics
    pub stats: StatsReporter,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Build the mixer over a UDP transport. Returns the receiving end of
    /// the outbound queue for the sender task.
    pub fn new(
        config: MixerConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let registry = Arc::new(SessionRegistry::with_limits(
            config.max_sessions,
            config.session_idle_timeout_secs,
            config.max_full_rate_distance,
        ));

        let (transport, outbound_rx) =
            UdpTransport::new(registry.clone(), config.outbound_queue_capacity);

        let settings = MixerSettings::from(&config);
        info!(
            max_sessions = config.max_sessions,
            max_full_rate_distance = config.max_full_rate_distance,
            payload_budget_bytes = settings.payload_budget_bytes,
            distance_step = settings.decimation.distance_step,
            max_interval_ticks = settings.decimation.max_interval_ticks,
            "Configuring mixer"
        );

        let mixer = Arc::new(AvatarMixer::new(
            registry.clone(),
            Arc::new(transport),
            settings,
        ));
        let stats = StatsReporter::new(registry.clone(), mixer.clone());

        let state = Self {
            config,
            registry,
            mixer,
            stats,
            shutdown_tx,
        };
        (state, outbound_rx)
    }

    /// Handler for inbound datagrams
    pub fn datagram_handler(&self) -> DatagramHandler {
        DatagramHandler::new(self.registry.clone(), self.mixer.clone())
    }
}
