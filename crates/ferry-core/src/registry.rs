//! Connection registry
//!
//! Owns every live channel of the host. Outbound opens and inbound accepts
//! are checked against the configured blacklist; every tracked channel is
//! torn down by [`ConnectionRegistry::close_all`] at shutdown.

use crate::config::RegistryConfig;
use crate::error::{Result, TransferError};
use crate::record::TransferKey;
use crate::signal::CompletionSignal;
use dashmap::DashMap;
use ferry_transport::{Channel, ChannelId, Connector};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::Instant;

type ConnectResult = std::result::Result<Arc<dyn Channel>, String>;

struct TrackedChannel {
    channel: Arc<dyn Channel>,
    inbound: bool,
    opened_at: Instant,
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Channels currently tracked
    pub live: usize,
    /// Successful outbound opens
    pub opened: u64,
    /// Inbound channels accepted
    pub accepted: u64,
    /// Inbound or outbound channels refused by the blacklist
    pub refused: u64,
}

/// Set of live channels to remote peers
pub struct ConnectionRegistry {
    config: RegistryConfig,
    connector: Arc<dyn Connector>,
    channels: DashMap<ChannelId, TrackedChannel>,
    bindings: DashMap<ChannelId, TransferKey>,
    shutting_down: AtomicBool,
    opened: AtomicU64,
    accepted: AtomicU64,
    refused: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a registry dialing through `connector`
    pub fn new(config: RegistryConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            channels: DashMap::new(),
            bindings: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            opened: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Whether the channel's peer is blacklisted.
    ///
    /// A peer whose address cannot be determined is not blacklisted.
    pub fn is_blacklisted(&self, channel: &dyn Channel) -> bool {
        match channel.remote_addr() {
            Some(addr) => self.is_host_blacklisted(addr.ip()),
            None => {
                tracing::debug!(
                    "Channel {} has no resolvable remote address, treating as allowed",
                    channel.id()
                );
                false
            }
        }
    }

    /// Whether `ip` is blacklisted
    pub fn is_host_blacklisted(&self, ip: IpAddr) -> bool {
        self.config.blacklist.contains(&ip)
    }

    /// Open a new channel to `addr`.
    ///
    /// # Errors
    /// `Blacklisted` for refused hosts, `Network` once every retry failed.
    pub async fn open_channel(&self, addr: SocketAddr) -> Result<Arc<dyn Channel>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(TransferError::Network("registry is shutting down".into()));
        }
        if self.is_host_blacklisted(addr.ip()) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return Err(TransferError::Blacklisted(addr.to_string()));
        }

        let retry = &self.config.retry;
        let mut last_error = String::new();
        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                let backoff = retry.backoff_duration(attempt - 1);
                tracing::debug!(
                    "Retrying connect to {} in {:?} (attempt {}/{})",
                    addr,
                    backoff,
                    attempt + 1,
                    retry.max_retries + 1
                );
                tokio::time::sleep(backoff).await;
            }

            match self.connect_once(addr).await {
                Ok(channel) => {
                    self.track(Arc::clone(&channel), false);
                    self.opened.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("Opened channel {} to {}", channel.id(), addr);
                    return Ok(channel);
                }
                Err(e) => {
                    tracing::warn!("Connect to {} failed: {}", addr, e);
                    last_error = e;
                }
            }
        }

        Err(TransferError::Network(format!(
            "{addr}: {last_error} after {} attempts",
            retry.max_retries + 1
        )))
    }

    /// One bounded connect attempt, its result delivered through a signal
    async fn connect_once(&self, addr: SocketAddr) -> ConnectResult {
        let signal = Arc::new(CompletionSignal::<ConnectResult>::new());
        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout;

        let dial = Arc::clone(&signal);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(addr)).await {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {timeout:?}")),
            };
            dial.resolve(result);
        });

        signal.wait().await
    }

    /// Register an inbound channel.
    ///
    /// Blacklisted peers are closed and refused.
    pub async fn accept(&self, channel: Arc<dyn Channel>) -> Result<Arc<dyn Channel>> {
        if self.is_blacklisted(channel.as_ref()) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            let peer = channel
                .remote_addr()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string());
            tracing::warn!("Refusing channel {} from blacklisted {}", channel.id(), peer);
            if let Err(e) = channel.close().await {
                tracing::debug!("Closing refused channel failed: {}", e);
            }
            return Err(TransferError::Blacklisted(peer));
        }
        if self.shutting_down.load(Ordering::Acquire) {
            let _ = channel.close().await;
            return Err(TransferError::Network("registry is shutting down".into()));
        }

        self.track(Arc::clone(&channel), true);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(channel)
    }

    fn track(&self, channel: Arc<dyn Channel>, inbound: bool) {
        self.channels.insert(
            channel.id(),
            TrackedChannel {
                channel,
                inbound,
                opened_at: Instant::now(),
            },
        );
    }

    /// Associate a channel with the transfer using it
    pub fn bind(&self, channel: ChannelId, key: TransferKey) {
        self.bindings.insert(channel, key);
    }

    /// Transfer currently bound to `channel`
    pub fn transfer_for(&self, channel: ChannelId) -> Option<TransferKey> {
        self.bindings.get(&channel).map(|k| k.value().clone())
    }

    /// Forget a channel that has been closed
    pub fn release(&self, channel: ChannelId) {
        self.bindings.remove(&channel);
        if let Some((_, tracked)) = self.channels.remove(&channel) {
            tracing::trace!(
                "Released {} channel {} after {:?}",
                if tracked.inbound { "inbound" } else { "outbound" },
                channel,
                tracked.opened_at.elapsed()
            );
        }
    }

    /// Whether `channel` is tracked
    pub fn contains(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel)
    }

    /// Close every tracked channel.
    ///
    /// Idempotent. Individual close failures are logged and skipped.
    pub async fn close_all(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let ids: Vec<ChannelId> = self.channels.iter().map(|e| *e.key()).collect();
        let mut closed = 0usize;
        for id in ids {
            let Some((_, tracked)) = self.channels.remove(&id) else {
                continue;
            };
            match tracked.channel.close().await {
                Ok(()) => closed += 1,
                Err(e) => tracing::warn!("Failed to close channel {}: {}", id, e),
            }
        }
        self.bindings.clear();

        if closed > 0 {
            tracing::info!("Closed {} channels", closed);
        }
    }

    /// Registry counters
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live: self.channels.len(),
            opened: self.opened.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}
