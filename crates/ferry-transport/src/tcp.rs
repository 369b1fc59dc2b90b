//! TCP channel implementation.
//!
//! One TCP connection carries exactly one transfer at a time. The stream is
//! split into owned halves so that reads and writes never contend on the
//! same lock.

use crate::channel::{
    Channel, ChannelId, ChannelStats, Connector, StatsCounters, TransportError, TransportResult,
    next_channel_id,
};
use crate::packet::Packet;
use crate::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

/// Keepalive idle time applied to every TCP channel
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Packet channel over a TCP stream
pub struct TcpChannel {
    id: ChannelId,
    remote: Option<SocketAddr>,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    stats: StatsCounters,
}

impl TcpChannel {
    /// Wrap an established stream.
    ///
    /// Enables `TCP_NODELAY` and TCP keepalive. A peer address that cannot be
    /// read is recorded as unknown rather than failing the channel.
    pub fn from_stream(stream: TcpStream) -> TransportResult<Self> {
        stream.set_nodelay(true)?;
        let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        let remote = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            id: next_channel_id(),
            remote,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        })
    }

    /// Connect to `addr`, giving up after `timeout`.
    ///
    /// # Errors
    /// Returns `TransportError::Timeout` on expiry and
    /// `TransportError::ConnectionFailed` if the peer refuses.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> TransportResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {addr}")))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;

        tracing::debug!("Connected to {}", addr);
        Self::from_stream(stream)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn send(&self, packet: &Packet) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = packet.encode()?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        self.stats.record_send(frame.len());
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Packet> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;

        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed);
            }
            Err(e) => return Err(e.into()),
        };
        if len + 4 < PACKET_HEADER_SIZE || len + 4 > MAX_PACKET_SIZE {
            return Err(crate::PacketError::Oversize(len + 4).into());
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;
        self.stats.record_recv(len + 4);

        Ok(Packet::decode_body(&body)?)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // Peer already went away
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> ChannelStats {
        self.stats.snapshot()
    }
}

/// Dials peers over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<Arc<dyn Channel>> {
        let channel = TcpChannel::connect(addr, self.connect_timeout).await?;
        Ok(Arc::new(channel))
    }
}
