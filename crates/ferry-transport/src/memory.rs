//! In-process channel pairs.
//!
//! Frames are encoded exactly as on TCP and handed to the peer through an
//! unbounded tokio channel, so encoding failures and close semantics behave
//! the same as with a real socket.

use crate::channel::{
    Channel, ChannelId, ChannelStats, StatsCounters, TransportError, TransportResult,
    next_channel_id,
};
use crate::packet::Packet;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};

/// One end of an in-memory channel pair
pub struct MemoryChannel {
    id: ChannelId,
    remote: Option<SocketAddr>,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
    stats: StatsCounters,
}

impl MemoryChannel {
    /// Create a connected pair with loopback remote addresses
    pub fn pair() -> (Self, Self) {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self::pair_with_addrs(
            Some(SocketAddr::new(localhost, 6667)),
            Some(SocketAddr::new(localhost, 6666)),
        )
    }

    /// Create a connected pair with explicit remote addresses.
    ///
    /// `a_remote` is what the first end reports as its peer address. Passing
    /// `None` models a peer whose address cannot be resolved.
    pub fn pair_with_addrs(
        a_remote: Option<SocketAddr>,
        b_remote: Option<SocketAddr>,
    ) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_closed = Arc::new(AtomicBool::new(false));
        let b_closed = Arc::new(AtomicBool::new(false));

        (
            Self::new(a_remote, a_tx, a_rx, Arc::clone(&a_closed), Arc::clone(&b_closed)),
            Self::new(b_remote, b_tx, b_rx, b_closed, a_closed),
        )
    }

    fn new(
        remote: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
        peer_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: next_channel_id(),
            remote,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed,
            peer_closed,
            stats: StatsCounters::default(),
        }
    }

    /// Whether the peer end has called `close`
    pub fn peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn send(&self, packet: &Packet) -> TransportResult<()> {
        // A closed peer never reads again
        if self.is_closed() || self.peer_closed() {
            return Err(TransportError::Closed);
        }
        let frame = packet.encode()?;
        let len = frame.len();

        let tx = self.tx.lock().await;
        let tx = tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)?;
        self.stats.record_send(len);
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Packet> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        self.stats.record_recv(frame.len());
        Ok(Packet::decode(&frame)?)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender lets the peer drain what is buffered, then see EOF
        self.tx.lock().await.take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> ChannelStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_exchange() {
        let (a, b) = MemoryChannel::pair();
        a.send(&Packet::EndTransfer {
            rank: 2,
            checksum: Some("ab".to_string()),
        })
        .await
        .unwrap();

        match b.recv().await.unwrap() {
            Packet::EndTransfer { rank, checksum } => {
                assert_eq!(rank, 2);
                assert_eq!(checksum.as_deref(), Some("ab"));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buffered_packets_survive_close() {
        let (a, b) = MemoryChannel::pair();
        a.send(&Packet::Data {
            rank: 0,
            payload: vec![0; 8],
        })
        .await
        .unwrap();
        a.close().await.unwrap();

        assert!(matches!(b.recv().await, Ok(Packet::Data { rank: 0, .. })));
        assert!(matches!(b.recv().await, Err(TransportError::Closed)));
        assert!(b.peer_closed());
    }

    #[tokio::test]
    async fn test_closed_end_rejects_io() {
        let (a, _b) = MemoryChannel::pair();
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(matches!(
            a.send(&Packet::EndTransfer { rank: 0, checksum: None }).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(a.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_send_to_closed_peer_fails() {
        let (a, b) = MemoryChannel::pair();
        b.close().await.unwrap();
        assert!(matches!(
            a.send(&Packet::EndTransfer { rank: 0, checksum: None }).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unresolved_remote_address() {
        let (a, b) = MemoryChannel::pair_with_addrs(None, None);
        assert!(a.remote_addr().is_none());
        assert!(b.remote_addr().is_none());
    }
}
