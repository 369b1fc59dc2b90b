//! Packet bridge
//!
//! Turns the terminal outcome of a transfer into exactly one wire message
//! and incoming packets into [`PeerEvent`]s. The finishing sequence of every
//! transfer is:
//!
//! 1. send the outcome message (bounded by a timeout, failures swallowed)
//! 2. resolve the transfer's completion signal
//! 3. close the channel
//!
//! Steps 2 and 3 are owned by an [`OutcomeGuard`], whose `Drop` still
//! resolves and closes if the transfer task unwinds or exits early.

use crate::error::{Result, TransferError};
use crate::local_channel::{LocalChannelReference, TransferFailure, TransferOutcome};
use ferry_transport::{Channel, Packet, RequestKind, RequestPacket, TransportError};
use std::sync::Arc;
use std::time::Duration;

/// Incoming packet interpreted for the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Transfer open or negotiation reply
    Request(RequestPacket),
    /// One block of data
    Block {
        /// Block index
        rank: u64,
        /// Block content
        payload: Vec<u8>,
    },
    /// Sender finished
    EndOfData {
        /// Blocks sent
        rank: u64,
        /// Whole-file digest
        checksum: Option<String>,
    },
    /// Peer reports success
    Accepted {
        /// Peer's final rank
        rank: u64,
        /// What is acknowledged
        kind: RequestKind,
    },
    /// Peer reports failure and closes
    Rejected {
        /// Human-readable detail
        message: String,
        /// Failure class
        cause: String,
        /// Blocks the peer holds committed
        rank: u64,
    },
}

/// Adapter between transfer outcomes and wire packets
#[derive(Debug, Clone)]
pub struct PacketBridge {
    outcome_timeout: Duration,
    recv_timeout: Duration,
}

impl PacketBridge {
    /// Create a bridge with the given send and receive bounds
    pub fn new(outcome_timeout: Duration, recv_timeout: Duration) -> Self {
        Self {
            outcome_timeout,
            recv_timeout,
        }
    }

    /// Success acknowledgement carrying the final rank
    pub fn success_packet(rank: u64) -> Packet {
        Packet::ValidAck {
            message: "transfer complete".to_string(),
            rank_token: rank.to_string(),
            request_kind: RequestKind::EndRequest,
        }
    }

    /// Error notice asking the peer to close, reporting the `rank` of
    /// blocks committed locally
    pub fn failure_packet(error: &TransferError, rank: u64) -> Packet {
        Packet::ErrorNotice {
            message: error.to_string(),
            cause: error.kind().to_string(),
            rank,
            forward_close: true,
        }
    }

    /// Outcome message for a resolved transfer
    pub fn outcome_packet(outcome: &TransferOutcome) -> Packet {
        match outcome {
            Ok(success) => Self::success_packet(success.record.rank),
            Err(failure) => Self::failure_packet(
                &failure.error,
                failure.record.as_ref().map_or(0, |record| record.rank),
            ),
        }
    }

    /// Send `packet`, bounded by the outcome timeout.
    ///
    /// Returns whether the packet was written. Encoding and send failures are
    /// logged, never returned.
    pub async fn deliver(&self, channel: &dyn Channel, packet: &Packet) -> bool {
        match tokio::time::timeout(self.outcome_timeout, channel.send(packet)).await {
            Ok(Ok(())) => true,
            Ok(Err(TransportError::Packet(e))) => {
                tracing::warn!(
                    "Outcome message for channel {} could not be encoded: {}",
                    channel.id(),
                    e
                );
                false
            }
            Ok(Err(e)) => {
                tracing::warn!("Outcome message on channel {} not sent: {}", channel.id(), e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Outcome message on channel {} timed out after {:?}",
                    channel.id(),
                    self.outcome_timeout
                );
                false
            }
        }
    }

    /// Interpret one incoming packet
    pub fn interpret(packet: Packet) -> Result<PeerEvent> {
        Ok(match packet {
            Packet::Request(request) => PeerEvent::Request(request),
            Packet::Data { rank, payload } => PeerEvent::Block { rank, payload },
            Packet::EndTransfer { rank, checksum } => PeerEvent::EndOfData { rank, checksum },
            Packet::ValidAck {
                rank_token,
                request_kind,
                ..
            } => {
                let rank = rank_token
                    .trim()
                    .parse()
                    .map_err(|_| TransferError::protocol("rank token is not a number"))?;
                PeerEvent::Accepted {
                    rank,
                    kind: request_kind,
                }
            }
            Packet::ErrorNotice {
                message,
                cause,
                rank,
                ..
            } => PeerEvent::Rejected {
                message,
                cause,
                rank,
            },
        })
    }

    /// Receive and interpret the next packet, bounded by the receive timeout.
    ///
    /// A channel closed without an outcome message is a network failure.
    pub async fn next_event(&self, channel: &dyn Channel) -> Result<PeerEvent> {
        tokio::time::timeout(self.recv_timeout, Self::recv_event(channel))
            .await
            .map_err(|_| TransferError::timeout("waiting for peer packet"))?
    }

    /// Receive and interpret the next packet without a time bound
    pub async fn recv_event(channel: &dyn Channel) -> Result<PeerEvent> {
        let packet = channel.recv().await.map_err(|e| match e {
            TransportError::Closed => {
                TransferError::Network("peer closed the channel without an outcome".into())
            }
            other => other.into(),
        })?;
        Self::interpret(packet)
    }

    /// Bound applied to every awaited packet
    pub fn recv_timeout(&self) -> Duration {
        self.recv_timeout
    }

    /// Arm a guard finishing the transfer bound to `local`
    pub fn guard(&self, local: Arc<LocalChannelReference>) -> OutcomeGuard {
        OutcomeGuard {
            local,
            armed: true,
        }
    }
}

impl Default for PacketBridge {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60))
    }
}

/// Scoped owner of the resolve-then-close sequence
#[derive(Debug)]
pub struct OutcomeGuard {
    local: Arc<LocalChannelReference>,
    armed: bool,
}

impl OutcomeGuard {
    /// The guarded channel reference
    pub fn local(&self) -> &Arc<LocalChannelReference> {
        &self.local
    }

    /// The guarded channel
    pub fn channel(&self) -> &Arc<dyn Channel> {
        self.local.channel()
    }

    /// Resolve the completion signal with `outcome`, then close the channel
    pub async fn finish(mut self, outcome: TransferOutcome) {
        self.armed = false;
        self.local.future_action().resolve(outcome);
        self.local.close().await;
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::error!(
            transfer = %self.local.key(),
            "Transfer task ended without an outcome, failing it"
        );
        let error = TransferError::system("transfer task ended without an outcome");
        let notice = PacketBridge::failure_packet(&error, 0);
        self.local
            .future_action()
            .resolve(Err(TransferFailure::new(error, None)));

        let local = Arc::clone(&self.local);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = local.channel().send(&notice).await;
                    local.close().await;
                });
            }
            Err(_) => tracing::warn!(
                "No runtime to close channel {}, dropping it",
                local.channel_id()
            ),
        }
    }
}
