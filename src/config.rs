//! Mixer configuration module
//!
//! Handles loading and parsing of mixer configuration from a TOML file and
//! environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::mixer::DecimationPolicy;
use crate::net::buffer::MAX_PACKET_SIZE;
use crate::protocol::HEADER_SIZE;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "config/mixer.toml";

/// Mixer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Address to bind sockets on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// UDP port for avatar traffic
    #[serde(default = "default_port")]
    pub port: u16,

    /// Management API port
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Mixer ticks per second
    #[serde(default = "default_tick_rate")]
    pub tick_rate_hz: u32,

    /// Full-rate distance given to new sessions, in metres
    #[serde(default = "default_max_full_rate_distance")]
    pub max_full_rate_distance: f32,

    /// Pose and identity bytes per observer per tick
    #[serde(default = "default_payload_budget")]
    pub payload_budget_bytes: usize,

    /// Assembly time allowance per observer in microseconds (0 to disable)
    #[serde(default = "default_max_assembly_time")]
    pub max_assembly_time_us: u64,

    /// Largest outbound datagram
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Reduced-rate schedule
    #[serde(default)]
    pub decimation: DecimationPolicy,

    /// Seconds of silence before a peer is disconnected
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Outbound datagrams that may wait for the socket
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    40103
}

fn default_api_port() -> u16 {
    40180
}

fn default_tick_rate() -> u32 {
    60
}

fn default_max_full_rate_distance() -> f32 {
    20.0
}

fn default_payload_budget() -> usize {
    6000
}

fn default_max_assembly_time() -> u64 {
    2000
}

fn default_max_packet_size() -> usize {
    1450
}

fn default_idle_timeout() -> u64 {
    5
}

fn default_max_sessions() -> usize {
    1024
}

fn default_outbound_queue_capacity() -> usize {
    4096
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            bind_address: default_bind_address(),
            port: default_port(),
            api_port: default_api_port(),
            tick_rate_hz: default_tick_rate(),
            max_full_rate_distance: default_max_full_rate_distance(),
            payload_budget_bytes: default_payload_budget(),
            max_assembly_time_us: default_max_assembly_time(),
            max_packet_size: default_max_packet_size(),
            decimation: DecimationPolicy::default(),
            session_idle_timeout_secs: default_idle_timeout(),
            max_sessions: default_max_sessions(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            debug: false,
        }
    }
}

impl MixerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("AVATAR_MIXER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        config.apply_env_overrides();

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("AVATAR_MIXER_BIND_ADDRESS") {
            self.bind_address = val;
        }
        if let Ok(val) = env::var("AVATAR_MIXER_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }
        if let Ok(val) = env::var("AVATAR_MIXER_API_PORT") {
            if let Ok(port) = val.parse() {
                self.api_port = port;
            }
        }
        if let Ok(val) = env::var("AVATAR_MIXER_TICK_RATE_HZ") {
            if let Ok(rate) = val.parse() {
                self.tick_rate_hz = rate;
            }
        }
        if let Ok(val) = env::var("AVATAR_MIXER_MAX_FULL_RATE_DISTANCE") {
            if let Ok(distance) = val.parse() {
                self.max_full_rate_distance = distance;
            }
        }
        if let Ok(val) = env::var("AVATAR_MIXER_PAYLOAD_BUDGET_BYTES") {
            if let Ok(budget) = val.parse() {
                self.payload_budget_bytes = budget;
            }
        }
        if let Ok(val) = env::var("AVATAR_MIXER_MAX_SESSIONS") {
            if let Ok(max) = val.parse() {
                self.max_sessions = max;
            }
        }
        if let Ok(val) = env::var("AVATAR_MIXER_DEBUG") {
            self.debug = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == self.api_port {
            anyhow::bail!("Mixer port and API port must be different");
        }

        if self.tick_rate_hz == 0 || self.tick_rate_hz > 1000 {
            anyhow::bail!("Tick rate must be between 1 and 1000 Hz");
        }

        if !self.max_full_rate_distance.is_finite() || self.max_full_rate_distance < 0.0 {
            anyhow::bail!("Max full rate distance must be a non-negative number");
        }

        if self.max_packet_size <= HEADER_SIZE || self.max_packet_size > MAX_PACKET_SIZE {
            anyhow::bail!(
                "Max packet size must be between {} and {} bytes",
                HEADER_SIZE + 1,
                MAX_PACKET_SIZE
            );
        }

        if self.payload_budget_bytes == 0 {
            anyhow::bail!("Payload budget must be greater than zero");
        }

        let step = self.decimation.distance_step;
        if !step.is_finite() || step <= 0.0 || self.decimation.max_interval_ticks == 0 {
            anyhow::bail!("Decimation step and max interval must be greater than zero");
        }

        if self.max_sessions == 0 {
            anyhow::bail!("Max sessions must be greater than zero");
        }

        if self.outbound_queue_capacity == 0 {
            anyhow::bail!("Outbound queue capacity must be greater than zero");
        }

        self.udp_address()?;
        Ok(())
    }

    /// Socket address for avatar traffic
    pub fn udp_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind_address))
    }

    /// Socket address for the management API
    pub fn api_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.api_port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.bind_address))
    }
}
