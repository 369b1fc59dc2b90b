//! Engine configuration

use crate::error::{Result, TransferError};
use crate::limiter::Limit;
use crate::machine::RankPolicy;
use crate::record::TransferMode;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Largest block size a single `Data` packet can carry
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of this host, used as owner and requester in transfer keys
    pub host_id: String,

    /// Listen address for inbound transfers
    pub listen_addr: SocketAddr,

    /// Directory receiving inbound files
    pub in_dir: PathBuf,

    /// Directory serving outbound files
    pub out_dir: PathBuf,

    /// Known partner hosts
    pub partners: HashMap<String, SocketAddr>,

    /// Maximum transfers executing at once
    pub max_concurrent: usize,

    /// Per-transfer settings
    pub transfer: TransferConfig,

    /// Channel management settings
    pub registry: RegistryConfig,

    /// Bandwidth policy
    pub limit: Limit,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_id: "ferry".to_string(),
            #[cfg(test)]
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            #[cfg(not(test))]
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6666)),
            in_dir: PathBuf::from("in"),
            out_dir: PathBuf::from("out"),
            partners: HashMap::new(),
            max_concurrent: 16,
            transfer: TransferConfig::default(),
            registry: RegistryConfig::default(),
            limit: Limit::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration for `host_id` with default settings
    pub fn for_host(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            ..Self::default()
        }
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.host_id.trim().is_empty() {
            return Err(TransferError::InvalidConfig("host_id must not be empty".into()));
        }
        if self.max_concurrent == 0 {
            return Err(TransferError::InvalidConfig(
                "max_concurrent must be at least 1".into(),
            ));
        }
        self.transfer.validate()?;
        self.registry.validate()
    }

    /// Resolve a partner host to its address.
    ///
    /// Unknown names are accepted if they parse as a socket address.
    pub fn partner_addr(&self, host: &str) -> Option<SocketAddr> {
        self.partners
            .get(host)
            .copied()
            .or_else(|| host.parse().ok())
    }
}

/// Per-transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Default block size in bytes
    pub block_size: u32,

    /// Default mode flags for new transfers
    pub mode: TransferMode,

    /// How divergent ranks are reconciled on resume
    pub rank_policy: RankPolicy,

    /// How long to wait for the next packet from the peer
    pub recv_timeout: Duration,

    /// Bound on sending the outcome message
    pub outcome_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: ferry_files::DEFAULT_BLOCK_SIZE as u32,
            mode: TransferMode::RECOVERY,
            rank_policy: RankPolicy::Minimum,
            recv_timeout: Duration::from_secs(60),
            outcome_timeout: Duration::from_secs(10),
        }
    }
}

impl TransferConfig {
    fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(TransferError::InvalidConfig(
                format!("block_size must be in 1..={MAX_BLOCK_SIZE}").into(),
            ));
        }
        if self.recv_timeout.is_zero() || self.outcome_timeout.is_zero() {
            return Err(TransferError::InvalidConfig(
                "transfer timeouts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Connection registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Hosts refused on accept and connect
    pub blacklist: HashSet<IpAddr>,

    /// Bound on a single connect attempt
    pub connect_timeout: Duration,

    /// Retry policy for opening channels
    pub retry: RetryConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            blacklist: HashSet::new(),
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl RegistryConfig {
    fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(TransferError::InvalidConfig(
                "connect_timeout must be positive".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(TransferError::InvalidConfig(
                "retry multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add random jitter so peers do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let duration = if self.jitter {
            // Up to 25% extra
            let mut buf = [0u8; 4];
            let _ = getrandom::getrandom(&mut buf);
            let jitter_factor = (u32::from_le_bytes(buf) % 25) as f64 / 100.0;
            capped * (1.0 + jitter_factor)
        } else {
            capped
        };

        Duration::from_millis(duration as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_block_size() {
        let mut config = EngineConfig::default();
        config.transfer.block_size = 0;
        assert!(matches!(
            config.validate(),
            Err(TransferError::InvalidConfig(_))
        ));

        config.transfer.block_size = MAX_BLOCK_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_host_id_rejected() {
        let config = EngineConfig::for_host("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partner_resolution() {
        let mut config = EngineConfig::for_host("a");
        let addr: SocketAddr = "10.0.0.2:6666".parse().unwrap();
        config.partners.insert("b".to_string(), addr);

        assert_eq!(config.partner_addr("b"), Some(addr));
        assert_eq!(
            config.partner_addr("127.0.0.1:7000"),
            Some("127.0.0.1:7000".parse().unwrap())
        );
        assert_eq!(config.partner_addr("unknown"), None);
    }

    #[test]
    fn test_retry_backoff_exponential() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.backoff_duration(0).as_millis(), 100);
        assert_eq!(config.backoff_duration(1).as_millis(), 200);
        assert_eq!(config.backoff_duration(2).as_millis(), 400);
        assert_eq!(config.backoff_duration(10).as_millis(), 10_000);
    }

    #[test]
    fn test_retry_backoff_with_jitter() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            jitter: true,
            ..RetryConfig::default()
        };
        let backoff = config.backoff_duration(0);
        assert!(backoff.as_millis() >= 100);
        assert!(backoff.as_millis() <= 125);
    }
}
