//! Node configuration
//!
//! Loaded from TOML with per-field defaults so a partial file is enough.
//! CLI flags override the file, the file overrides the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::Chain;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aleph-ccn")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for the database and the local object store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ipfs: IpfsConfig,

    #[serde(default)]
    pub p2p: P2pConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub balances: BalancesConfig,

    /// One entry per indexed chain
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

/// Local object store and garbage collection knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Grace period before an unpinned file is deleted, seconds
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Grace period for temporary uploads, seconds
    #[serde(default = "default_grace_period_temp")]
    pub grace_period_temp_secs: u64,

    /// Garbage collector pass interval, seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Files above this size require a balance check, bytes
    #[serde(default = "default_free_storage_limit")]
    pub free_storage_limit_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpfsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the IPFS daemon HTTP API
    #[serde(default = "default_ipfs_url")]
    pub api_url: String,

    /// Per-call timeout, seconds
    #[serde(default = "default_ipfs_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// WebSocket URL of the external P2P daemon
    #[serde(default = "default_p2p_daemon_url")]
    pub daemon_url: String,

    /// Pub/sub topic carrying message announcements
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Token-bucket publish limit per channel, messages per second
    #[serde(default = "default_publish_rate")]
    pub publish_rate: u32,
}

/// Work-queue and worker-pool knobs for the processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pending-message workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Rows claimed per polling pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-type concurrency caps, in MessageType::ALL order
    /// (AGGREGATE, POST, STORE, FORGET, PROGRAM)
    #[serde(default = "default_per_type_limits")]
    pub per_type_limits: [usize; 5],

    /// Content fetch timeout, seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Retry backoff base, seconds
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,

    /// Retry backoff cap, seconds
    #[serde(default = "default_retry_cap")]
    pub retry_cap_secs: u64,

    /// Attempts before a row is demoted to the rejected table
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Claims expire and become re-claimable after this long, seconds
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,

    /// Queue poll interval when idle, milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Above this many pending messages, P2P and HTTP ingress push back
    #[serde(default = "default_high_watermark")]
    pub pending_high_watermark: u64,

    /// Accept on-chain messages flagged check_message = false without
    /// re-verifying their signature
    #[serde(default)]
    pub trusted_onchain: bool,

    /// Tie-break direction for aggregate elements sharing a timestamp
    #[serde(default)]
    pub aggregate_tie_break: TieBreak,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    ItemHashAsc,
    ItemHashDesc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancesConfig {
    /// Reconciler pass interval, seconds
    #[serde(default = "default_balance_interval")]
    pub interval_secs: u64,

    /// POST type carrying balance snapshots
    #[serde(default = "default_balances_post_type")]
    pub post_type: String,

    /// Addresses trusted to publish balance snapshots
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Per-chain indexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain: Chain,

    /// JSON-RPC or indexer endpoint
    pub rpc_endpoint: String,

    /// Sync contract address (EVM) or indexed source account
    pub contract_address: String,

    #[serde(default)]
    pub start_height: u64,

    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,

    /// Blocks fetched per range
    #[serde(default = "default_window")]
    pub window: u64,

    /// Poll interval, seconds
    #[serde(default = "default_chain_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_grace_period() -> u64 {
    24 * 3600
}

fn default_grace_period_temp() -> u64 {
    3600
}

fn default_gc_interval() -> u64 {
    3600
}

fn default_free_storage_limit() -> u64 {
    25 * 1024 * 1024
}

fn default_ipfs_url() -> String {
    "http://127.0.0.1:5001".to_string()
}

fn default_ipfs_timeout() -> u64 {
    30
}

fn default_p2p_daemon_url() -> String {
    "ws://127.0.0.1:4025".to_string()
}

fn default_topic() -> String {
    "ALEPH-TEST".to_string()
}

fn default_publish_rate() -> u32 {
    50
}

fn default_workers() -> usize {
    8
}

fn default_batch_size() -> usize {
    100
}

fn default_per_type_limits() -> [usize; 5] {
    [4, 4, 2, 2, 2]
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_retry_base() -> u64 {
    5
}

fn default_retry_cap() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    10
}

fn default_claim_timeout() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_high_watermark() -> u64 {
    100_000
}

fn default_balance_interval() -> u64 {
    4 * 3600
}

fn default_balances_post_type() -> String {
    "balances-update".to_string()
}

fn default_confirmation_depth() -> u64 {
    12
}

fn default_window() -> u64 {
    1000
}

fn default_chain_poll_interval() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage: StorageConfig::default(),
            ipfs: IpfsConfig::default(),
            p2p: P2pConfig::default(),
            pipeline: PipelineConfig::default(),
            balances: BalancesConfig::default(),
            chains: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            grace_period_temp_secs: default_grace_period_temp(),
            gc_interval_secs: default_gc_interval(),
            free_storage_limit_bytes: default_free_storage_limit(),
        }
    }
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_ipfs_url(),
            timeout_secs: default_ipfs_timeout(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daemon_url: default_p2p_daemon_url(),
            topic: default_topic(),
            publish_rate: default_publish_rate(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            per_type_limits: default_per_type_limits(),
            fetch_timeout_secs: default_fetch_timeout(),
            retry_base_secs: default_retry_base(),
            retry_cap_secs: default_retry_cap(),
            max_retries: default_max_retries(),
            claim_timeout_secs: default_claim_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            pending_high_watermark: default_high_watermark(),
            trusted_onchain: false,
            aggregate_tie_break: TieBreak::default(),
        }
    }
}

impl Default for BalancesConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_balance_interval(),
            post_type: default_balances_post_type(),
            addresses: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Root of the local object store
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Database path
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ccn.db")
    }

    /// Config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
