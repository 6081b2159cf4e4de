//! Node configuration loading and management.

use duplex_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Full configuration for a Duplex node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    /// Protocol engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Peer-to-peer transport settings.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Admin API settings.
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Settlement chain parameters.
    #[serde(default)]
    pub chain: ChainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Hex-encoded ed25519 secret key file. Generated on first start.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_p2p_port")]
    pub port: u16,
    /// Peers dialed on start.
    #[serde(default)]
    pub bootstrap_peers: Vec<PeerEndpoint>,
    /// Next hops for destinations without a direct channel.
    #[serde(default)]
    pub routes: Vec<StaticRoute>,
}

/// A peer address and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub addr: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub dest: String,
    pub token: String,
    pub cid: String,
    pub next_hop: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_addr")]
    pub listen_addr: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Unix timestamp (seconds) of block zero.
    #[serde(default)]
    pub genesis_timestamp: i64,
    #[serde(default = "default_block_interval")]
    pub block_interval_secs: u64,
}

fn default_key_path() -> PathBuf {
    PathBuf::from("./data/node.key")
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0".into()
}
fn default_p2p_port() -> u16 {
    7100
}
fn default_api_addr() -> String {
    "127.0.0.1".into()
}
fn default_api_port() -> u16 {
    7101
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/db")
}
fn default_block_interval() -> u64 {
    12
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_p2p_port(),
            bootstrap_peers: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_api_addr(),
            port: default_api_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            genesis_timestamp: 0,
            block_interval_secs: default_block_interval(),
        }
    }
}

impl NodeConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn p2p_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.network.listen_addr, self.network.port).parse()?)
    }

    pub fn api_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.api.listen_addr, self.api.port).parse()?)
    }
}
