//! Binding between one running transfer and its network channel.

use crate::error::{FailureKind, TransferError};
use crate::record::{TransferKey, TransferRecord};
use crate::registry::ConnectionRegistry;
use crate::signal::CompletionSignal;
use ferry_transport::{Channel, ChannelId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Successful end of a transfer
#[derive(Debug, Clone)]
pub struct TransferSuccess {
    /// Final record snapshot
    pub record: TransferRecord,
    /// Hex BLAKE3 digest when the mode requested one
    pub checksum: Option<String>,
}

/// Failed end of a transfer
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} failure: {error}")]
pub struct TransferFailure {
    /// Classification
    pub kind: FailureKind,
    /// Cause
    pub error: TransferError,
    /// Final record snapshot, absent if the transfer died before owning one
    pub record: Option<TransferRecord>,
}

impl TransferFailure {
    /// Build a failure from its cause
    pub fn new(error: TransferError, record: Option<TransferRecord>) -> Self {
        Self {
            kind: error.kind(),
            error,
            record,
        }
    }
}

/// What a transfer's completion signal resolves to
pub type TransferOutcome = std::result::Result<TransferSuccess, TransferFailure>;

/// Ties one in-process transfer to exactly one network channel
pub struct LocalChannelReference {
    local_id: u64,
    remote_id: OnceLock<u64>,
    key: TransferKey,
    channel: Arc<dyn Channel>,
    future_action: Arc<CompletionSignal<TransferOutcome>>,
    closed: Arc<CompletionSignal<()>>,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl LocalChannelReference {
    /// Bind `channel` to the transfer `key`.
    ///
    /// When a registry is given, closing the reference also releases the
    /// channel from it.
    pub fn new(
        key: TransferKey,
        channel: Arc<dyn Channel>,
        future_action: Arc<CompletionSignal<TransferOutcome>>,
        closed: Arc<CompletionSignal<()>>,
        registry: Option<Arc<ConnectionRegistry>>,
    ) -> Self {
        if let Some(registry) = &registry {
            registry.bind(channel.id(), key.clone());
        }
        Self {
            local_id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            remote_id: OnceLock::new(),
            key,
            channel,
            future_action,
            closed,
            registry,
        }
    }

    /// Process-unique id of this reference
    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Peer's local id, once learned from its request
    pub fn remote_id(&self) -> Option<u64> {
        self.remote_id.get().copied()
    }

    /// Record the peer's local id; later calls are ignored
    pub fn set_remote_id(&self, id: u64) {
        let _ = self.remote_id.set(id);
    }

    /// Transfer owning this reference
    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    /// The bound channel
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Id of the bound channel
    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Peer address, if known
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    /// Signal resolved with the transfer outcome
    pub fn future_action(&self) -> &Arc<CompletionSignal<TransferOutcome>> {
        &self.future_action
    }

    /// Signal resolved once the channel is closed
    pub fn closed(&self) -> &Arc<CompletionSignal<()>> {
        &self.closed
    }

    /// Close the channel, release it from the registry and fire `closed`.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            tracing::warn!(
                transfer = %self.key,
                "Failed to close channel {}: {}",
                self.channel.id(),
                e
            );
        }
        if let Some(registry) = &self.registry {
            registry.release(self.channel.id());
        }
        if self.closed.resolve(()) {
            tracing::debug!(transfer = %self.key, "Channel {} closed", self.channel.id());
        }
    }
}

impl std::fmt::Debug for LocalChannelReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannelReference")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id())
            .field("key", &self.key)
            .field("channel", &self.channel.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_transport::MemoryChannel;

    fn reference(channel: Arc<dyn Channel>) -> LocalChannelReference {
        LocalChannelReference::new(
            TransferKey::new("a", "a", "b", 1),
            channel,
            Arc::new(CompletionSignal::new()),
            Arc::new(CompletionSignal::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_close_fires_signal_once() {
        let (a, _b) = MemoryChannel::pair();
        let local = reference(Arc::new(a));

        local.close().await;
        local.close().await;
        assert!(local.closed().is_resolved());
        assert!(local.channel().is_closed());
    }

    #[tokio::test]
    async fn test_remote_id_set_once() {
        let (a, _b) = MemoryChannel::pair();
        let local = reference(Arc::new(a));
        assert_eq!(local.remote_id(), None);

        local.set_remote_id(5);
        local.set_remote_id(6);
        assert_eq!(local.remote_id(), Some(5));
    }

    #[test]
    fn test_local_ids_unique() {
        let (a, b) = MemoryChannel::pair();
        let first = reference(Arc::new(a));
        let second = reference(Arc::new(b));
        assert_ne!(first.local_id(), second.local_id());
    }

    #[test]
    fn test_failure_display() {
        let failure = TransferFailure::new(TransferError::ChecksumMismatch, None);
        assert_eq!(failure.kind, FailureKind::Runner);
        assert!(failure.to_string().starts_with("runner failure"));
    }
}
