//! Channel trait abstraction over physical connections.
//!
//! A channel carries whole packets between two peers. Transfers never touch
//! sockets directly; they own an `Arc<dyn Channel>` for their lifetime and the
//! connection registry keeps track of every live channel.

use crate::packet::{Packet, PacketError};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide unique channel identifier
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh channel id
pub fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Channel is closed
    #[error("Channel is closed")]
    Closed,

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation did not complete in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Packet could not be encoded or decoded
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async packet channel between two peers.
///
/// Implementations use interior synchronization so that a single channel can
/// be shared between the task reading from it and the task writing to it.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique id of this channel
    fn id(&self) -> ChannelId;

    /// Remote peer address, `None` when it cannot be determined
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Encode and write one packet.
    ///
    /// # Errors
    /// Returns `TransportError::Packet` if encoding fails, `Closed` if the
    /// channel was closed, `Io` on write failure.
    async fn send(&self, packet: &Packet) -> TransportResult<()>;

    /// Read the next packet.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` when the peer closed the channel.
    async fn recv(&self) -> TransportResult<Packet>;

    /// Close the channel. Closing an already closed channel succeeds.
    async fn close(&self) -> TransportResult<()>;

    /// Check if the channel is closed
    fn is_closed(&self) -> bool;

    /// Channel statistics
    fn stats(&self) -> ChannelStats {
        ChannelStats::default()
    }
}

/// Dials remote peers
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new channel to `addr`
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Arc<dyn Channel>>;
}

/// Channel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
}

/// Lock-free counters backing `ChannelStats`
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }
}
