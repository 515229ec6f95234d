//! Avatar Mixer
//!
//! Relays avatar state between participants of a shared virtual world over
//! UDP, with an HTTP management API for health and statistics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use avatar_mixer::api::{self, ApiState};
use avatar_mixer::config::MixerConfig;
use avatar_mixer::net::{run_idle_sweep, run_sender};
use avatar_mixer::state::AppState;
use avatar_mixer::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so `debug` can raise the log level
    let config = MixerConfig::load().await?;

    init_logging(config.debug);

    info!(version = VERSION, "Avatar mixer starting");
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (state, outbound_rx) = AppState::new(config.clone(), shutdown_tx.clone());
    let state = Arc::new(state);
    info!("Application state initialized");

    // Bind the avatar socket
    let udp_addr = config.udp_address()?;
    let socket = Arc::new(UdpSocket::bind(udp_addr).await?);
    info!("Mixer listening on: {} (udp)", udp_addr);

    // Outbound datagrams
    let sender_handle = tokio::spawn(run_sender(
        socket.clone(),
        outbound_rx,
        shutdown_tx.subscribe(),
    ));

    // Inbound datagrams
    let handler = state.datagram_handler();
    let receiver_socket = socket.clone();
    let receiver_shutdown_rx = shutdown_tx.subscribe();
    let receiver_handle = tokio::spawn(async move {
        handler.run(receiver_socket, receiver_shutdown_rx).await;
    });

    // Idle sweep
    let sweep_period = Duration::from_secs(config.session_idle_timeout_secs.max(1));
    let sweep_handle = tokio::spawn(run_idle_sweep(
        state.registry.clone(),
        sweep_period,
        shutdown_tx.subscribe(),
    ));

    // Tick loop
    let tick_handle = tokio::spawn(
        state
            .mixer
            .clone()
            .run(config.tick_rate_hz, shutdown_tx.subscribe()),
    );

    // Management API
    let api_addr = config.api_address()?;
    let api_listener = TcpListener::bind(api_addr).await?;
    info!("Management API listening on: {}", api_addr);
    let api_state = ApiState::new(state.registry.clone(), state.stats.clone());
    let api_handle = tokio::spawn(run_api_server(
        api_listener,
        api_state,
        shutdown_tx.subscribe(),
    ));

    info!("Mixer startup complete!");

    // Wait for shutdown signal
    wait_for_shutdown(shutdown_tx.clone()).await;

    info!("Shutting down mixer...");

    let _ = tick_handle.await;
    let _ = receiver_handle.await;
    let _ = sweep_handle.await;
    let _ = api_handle.await;

    state.registry.disconnect_all();
    info!("All sessions disconnected");

    let _ = sender_handle.await;

    info!("Mixer shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(debug: bool) {
    let default_filter = if debug {
        "debug,avatar_mixer=trace"
    } else {
        "info,avatar_mixer=debug"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
}

/// Run the HTTP API server
async fn run_api_server(
    listener: TcpListener,
    state: ApiState,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let router = api::create_router(state);

    info!("Starting management API server...");

    let shutdown_signal = async move {
        let _ = shutdown_rx.recv().await;
        info!("Management API server shutting down");
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .unwrap_or_else(|e| error!("API server error: {}", e));
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
