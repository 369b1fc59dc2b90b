//! Configuration file for the FERRY CLI.

use ferry_core::{EngineConfig, Limit, RankPolicy, RetryConfig, Rule, TransferMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// FERRY configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Bandwidth limits, bytes per second
    #[serde(default)]
    pub limit: Limit,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Partner name to address
    #[serde(default)]
    pub partners: BTreeMap<String, String>,
    /// Task rules
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name of this host
    #[serde(default = "default_host_id")]
    pub host_id: String,
    /// Directory holding transfer records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory receiving inbound files
    #[serde(default = "default_in_dir")]
    pub in_dir: PathBuf,
    /// Directory serving outbound files
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Connect retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Refused peer addresses
    #[serde(default)]
    pub blacklist: Vec<String>,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Maximum concurrent transfers
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Verify a whole-file checksum
    #[serde(default = "default_true")]
    pub checksum: bool,
    /// Enable resume support
    #[serde(default = "default_true")]
    pub enable_resume: bool,
    /// Rank reconciliation on resume: minimum, local or remote
    #[serde(default = "default_rank_policy")]
    pub rank_policy: String,
    /// Seconds to wait for the next peer packet
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_host_id() -> String {
    "ferry".to_string()
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("ferry")
}

fn default_in_dir() -> PathBuf {
    default_state_dir().join("in")
}

fn default_out_dir() -> PathBuf {
    default_state_dir().join("out")
}

fn default_listen_addr() -> String {
    "0.0.0.0:6666".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_block_size() -> u32 {
    64 * 1024
}

fn default_max_concurrent() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_rank_policy() -> String {
    "minimum".to_string()
}

fn default_recv_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host_id: default_host_id(),
            state_dir: default_state_dir(),
            in_dir: default_in_dir(),
            out_dir: default_out_dir(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            blacklist: Vec::new(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_concurrent: default_max_concurrent(),
            checksum: true,
            enable_resume: true,
            rank_policy: default_rank_policy(),
            recv_timeout_secs: default_recv_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("ferry/config.toml")
    }

    /// Load config from default path, or the defaults if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.to_engine_config()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                anyhow::bail!("Rule '{}' defined twice", rule.id);
            }
        }
        Ok(())
    }

    /// Build the engine configuration
    ///
    /// # Errors
    ///
    /// Returns an error if an address, the rank policy or an engine setting
    /// is invalid.
    pub fn to_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = EngineConfig::for_host(self.node.host_id.clone());
        config.listen_addr = self
            .network
            .listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {e}", self.network.listen_addr))?;
        config.in_dir = self.node.in_dir.clone();
        config.out_dir = self.node.out_dir.clone();
        config.max_concurrent = self.transfer.max_concurrent;
        config.limit = self.limit;

        for (name, addr) in &self.partners {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| anyhow::anyhow!("Partner '{name}' has invalid address '{addr}'"))?;
            config.partners.insert(name.clone(), addr);
        }

        config.transfer.block_size = self.transfer.block_size;
        config.transfer.rank_policy = self.transfer.rank_policy.parse::<RankPolicy>()?;
        config.transfer.recv_timeout = Duration::from_secs(self.transfer.recv_timeout_secs);
        let mut mode = TransferMode::NORMAL;
        if self.transfer.checksum {
            mode = mode.with(TransferMode::CHECKSUM);
        }
        if self.transfer.enable_resume {
            mode = mode.with(TransferMode::RECOVERY);
        }
        config.transfer.mode = mode;

        config.registry.connect_timeout = Duration::from_secs(self.network.connect_timeout_secs);
        config.registry.retry = RetryConfig {
            max_retries: self.network.max_retries,
            ..RetryConfig::default()
        };
        for entry in &self.network.blacklist {
            let ip: IpAddr = entry
                .parse()
                .map_err(|_| anyhow::anyhow!("Blacklist entry '{entry}' is not an IP address"))?;
            config.registry.blacklist.insert(ip);
        }

        config.validate()?;
        Ok(config)
    }
}
