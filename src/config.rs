use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assembly::BLOCK_CAPACITY;
use crate::seeds::DEFAULT_MAX_SEED_NODES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the node accepts streams on (e.g., "127.0.0.1:7400")
    pub listen_addr: SocketAddr,
    /// Directory holding this node's local store
    pub data_dir: PathBuf,
    /// Path of the master store shared by every node
    pub master_path: PathBuf,
    /// File listing known node addresses
    pub seed_file: PathBuf,
    /// Pause between attempts to open a locked store
    #[serde(default = "default_store_retry_interval")]
    pub store_retry_interval: Duration,
    /// Transactions per block
    #[serde(default = "default_block_capacity")]
    pub block_capacity: usize,
    /// Deadline for connecting to a peer
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default = "default_max_seed_nodes")]
    pub max_seed_nodes: usize,
    /// Keep the local store on shutdown instead of deleting it
    #[serde(default)]
    pub keep_local_store: bool,
    /// Require transfer signatures to be the sender's own secret key
    #[serde(default)]
    pub verify_sender_secret: bool,
    /// Address the HTTP gateway listens on
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: SocketAddr,
}

const fn default_store_retry_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_block_capacity() -> usize {
    BLOCK_CAPACITY
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_seed_nodes() -> usize {
    DEFAULT_MAX_SEED_NODES
}

fn default_gateway_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            data_dir: PathBuf::from("data"),
            master_path: PathBuf::from("data/master"),
            seed_file: PathBuf::from("seeds.txt"),
            store_retry_interval: default_store_retry_interval(),
            block_capacity: default_block_capacity(),
            connect_timeout: default_connect_timeout(),
            max_seed_nodes: default_max_seed_nodes(),
            keep_local_store: false,
            verify_sender_secret: false,
            gateway_addr: default_gateway_addr(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl NodeConfig {
    /// Defaults overridden by `PEERLEDGER_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env_parse("PEERLEDGER_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: env_parse("PEERLEDGER_DATA_DIR").unwrap_or(defaults.data_dir),
            master_path: env_parse("PEERLEDGER_MASTER_PATH").unwrap_or(defaults.master_path),
            seed_file: env_parse("PEERLEDGER_SEED_FILE").unwrap_or(defaults.seed_file),
            store_retry_interval: env_parse("PEERLEDGER_STORE_RETRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.store_retry_interval),
            block_capacity: env_parse("PEERLEDGER_BLOCK_CAPACITY").unwrap_or(defaults.block_capacity),
            connect_timeout: env_parse("PEERLEDGER_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            max_seed_nodes: env_parse("PEERLEDGER_MAX_SEED_NODES").unwrap_or(defaults.max_seed_nodes),
            keep_local_store: env_parse("PEERLEDGER_KEEP_LOCAL_STORE").unwrap_or(defaults.keep_local_store),
            verify_sender_secret: env_parse("PEERLEDGER_VERIFY_SENDER_SECRET")
                .unwrap_or(defaults.verify_sender_secret),
            gateway_addr: env_parse("PEERLEDGER_GATEWAY_ADDR").unwrap_or(defaults.gateway_addr),
        }
    }
}
