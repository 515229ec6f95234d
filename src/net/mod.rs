//! Networking module
//!
//! UDP front end of the mixer:
//! - Packet buffer with the wire encodings
//! - Inbound datagram handling and idle sweep
//! - Outbound queue and sender task

pub mod buffer;
pub mod handler;
pub mod transport;

pub use handler::{run_idle_sweep, DatagramHandler};
pub use transport::{run_sender, UdpTransport};
