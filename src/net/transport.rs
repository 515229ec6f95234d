//! UDP transport module
//!
//! Outbound side of the mixer's UDP front end. The tick hands packets to
//! [`UdpTransport`], which resolves the session's address and queues the
//! datagram without blocking; a single sender task drains the queue onto the
//! socket.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::error::DeliveryError;
use crate::mixer::Transport;
use crate::session::{SessionId, SessionRegistry};

/// A datagram waiting for the socket
pub type Outbound = (SocketAddr, Bytes);

/// Queues datagrams for connected sessions
pub struct UdpTransport {
    registry: Arc<SessionRegistry>,
    outbound: mpsc::Sender<Outbound>,
}

impl UdpTransport {
    /// Create the transport and the receiving end of its queue
    pub fn new(registry: Arc<SessionRegistry>, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (Self { registry, outbound }, rx)
    }
}

impl Transport for UdpTransport {
    fn send(&self, session_id: SessionId, packet: Bytes) -> Result<(), DeliveryError> {
        let session = self
            .registry
            .get(session_id)
            .ok_or(DeliveryError::PeerGone(session_id))?;

        self.outbound
            .try_send((session.address, packet))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::ChannelClosed,
            })
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("capacity", &self.outbound.capacity())
            .finish()
    }
}

/// Drain the outbound queue onto the socket until shutdown or until every
/// sender is gone
pub async fn run_sender(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<Outbound>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Starting UDP sender");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some((address, packet)) = outbound else {
                    debug!("Outbound queue closed");
                    break;
                };
                match socket.send_to(&packet, address).await {
                    Ok(sent) => trace!(address = %address, bytes = sent, "Datagram sent"),
                    Err(e) => warn!(address = %address, error = %e, "Failed to send datagram"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("UDP sender shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_send_queues_to_session_address() {
        let registry = Arc::new(SessionRegistry::new());
        let session = registry.connect(addr(7000)).unwrap();
        let (transport, mut rx) = UdpTransport::new(registry, 4);

        transport
            .send(session.id, Bytes::from_static(b"hello"))
            .unwrap();

        let (address, packet) = rx.try_recv().unwrap();
        assert_eq!(address, addr(7000));
        assert_eq!(&packet[..], b"hello");
    }

    #[test]
    fn test_send_to_missing_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (transport, _rx) = UdpTransport::new(registry, 4);

        assert_eq!(
            transport.send(5, Bytes::new()),
            Err(DeliveryError::PeerGone(5))
        );
    }

    #[test]
    fn test_send_queue_full() {
        let registry = Arc::new(SessionRegistry::new());
        let session = registry.connect(addr(7000)).unwrap();
        let (transport, _rx) = UdpTransport::new(registry, 1);

        assert!(transport.send(session.id, Bytes::new()).is_ok());
        assert_eq!(
            transport.send(session.id, Bytes::new()),
            Err(DeliveryError::QueueFull)
        );
    }

    #[test]
    fn test_send_channel_closed() {
        let registry = Arc::new(SessionRegistry::new());
        let session = registry.connect(addr(7000)).unwrap();
        let (transport, rx) = UdpTransport::new(registry, 1);
        drop(rx);

        assert_eq!(
            transport.send(session.id, Bytes::new()),
            Err(DeliveryError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_sender_delivers_datagrams() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(run_sender(server, rx, shutdown_rx));
        tx.send((client.local_addr().unwrap(), Bytes::from_static(b"ping")))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
