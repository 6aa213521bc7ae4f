use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Quarks per coin. All amounts in the system are integer quarks.
pub const QUARKS_PER_COIN: u64 = 1_000_000_000;

/// Which chain this node participates in. Consensus parameters, the wire
/// magic and the genesis block are all selected by this value; peers on
/// different networks reject each other during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Dev,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Dev => "dev",
        }
    }
}

impl std::str::FromStr for NetworkType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(NetworkType::Mainnet),
            "testnet" => Ok(NetworkType::Testnet),
            "dev" => Ok(NetworkType::Dev),
            other => Err(CoreError::Config(format!("unknown network type: {other}"))),
        }
    }
}

/// Static per-network constants. These are consensus: every peer on a
/// network must agree on all of them.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: NetworkType,
    /// Wire magic carried in the block files and checked on every framed read.
    pub magic: [u8; 4],
    /// Version byte of binary addresses on this network.
    pub address_version: u8,
    /// UTC seconds stamped into the genesis header.
    pub genesis_timestamp: u64,
    /// Seed string the genesis address is derived from.
    pub genesis_seed: &'static str,
    /// Pre-mined supply credited to the genesis address, in quarks.
    pub genesis_premine: u64,
    /// Compact-bits difficulty of the genesis block (also the minimum
    /// difficulty: retargets never drop below it).
    pub genesis_bits: u32,
    /// Default peers dialed until `target_peers` sessions exist.
    pub bootstrap: &'static [&'static str],
    pub default_p2p_port: u16,
}

impl NetworkParams {
    pub fn for_network(network: NetworkType) -> &'static NetworkParams {
        match network {
            NetworkType::Mainnet => &MAINNET,
            NetworkType::Testnet => &TESTNET,
            NetworkType::Dev => &DEV,
        }
    }
}

static MAINNET: NetworkParams = NetworkParams {
    network: NetworkType::Mainnet,
    magic: [0xd9, 0xb4, 0xbe, 0xf9],
    address_version: 0x01,
    genesis_timestamp: 1_714_521_600, // 2024-05-01 00:00:00 UTC
    genesis_seed: "qubitcoin-mainnet-v1",
    genesis_premine: 20_000_000 * QUARKS_PER_COIN,
    genesis_bits: 0x1f00ffff,
    bootstrap: &["seed1.qubitcoin.net:9567", "seed2.qubitcoin.net:9567"],
    default_p2p_port: 9567,
};

static TESTNET: NetworkParams = NetworkParams {
    network: NetworkType::Testnet,
    magic: [0xd9, 0xb4, 0xbe, 0xfa],
    address_version: 0x02,
    genesis_timestamp: 1_714_521_600,
    genesis_seed: "qubitcoin-testnet-v1",
    genesis_premine: 20_000_000 * QUARKS_PER_COIN,
    genesis_bits: 0x2000ffff,
    bootstrap: &["testseed.qubitcoin.net:19567"],
    default_p2p_port: 19567,
};

static DEV: NetworkParams = NetworkParams {
    network: NetworkType::Dev,
    magic: [0xd9, 0xb4, 0xbe, 0xfb],
    address_version: 0x03,
    genesis_timestamp: 1_714_521_600,
    genesis_seed: "qubitcoin-dev-v1",
    genesis_premine: 20_000_000 * QUARKS_PER_COIN,
    // Regtest-grade target: roughly every other hash satisfies it, so tests
    // and local mining never grind.
    genesis_bits: 0x207fffff,
    bootstrap: &[],
    default_p2p_port: 29567,
};

/// Top-level node configuration, loadable from TOML with environment
/// overrides. Consensus parameters live in [`ConsensusConfig`] and must be
/// identical across peers on a network.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub network_type: NetworkType,
    pub p2p: P2pConfig,
    pub mining: MiningConfig,
    pub mempool: MempoolConfig,
    pub consensus: ConsensusConfig,
    pub storage: StorageConfig,
}

impl Default for NetworkType {
    fn default() -> Self {
        NetworkType::Mainnet
    }
}

impl Config {
    pub fn mainnet() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            network_type: NetworkType::Mainnet,
            ..Default::default()
        }
    }

    pub fn testnet() -> Self {
        Self {
            data_dir: PathBuf::from("./data-testnet"),
            network_type: NetworkType::Testnet,
            ..Default::default()
        }
    }

    /// Local development chain: trivial PoW, short timings, no bootstrap.
    pub fn dev() -> Self {
        Self {
            data_dir: PathBuf::from("./data-dev"),
            network_type: NetworkType::Dev,
            p2p: P2pConfig {
                listen_port: DEV.default_p2p_port,
                ..Default::default()
            },
            consensus: ConsensusConfig {
                retarget_window: 16,
                n_measurement: 8,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn params(&self) -> &'static NetworkParams {
        NetworkParams::for_network(self.network_type)
    }

    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::Config(format!("cannot read config file: {e}")))?;
        let mut config: Config = toml::from_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> crate::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path.as_ref(), text)
            .map_err(|e| CoreError::Config(format!("cannot write config file: {e}")))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("QUBIT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("QUBIT_P2P_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.p2p.listen_port = port;
            }
        }
        if let Ok(threads) = std::env::var("QUBIT_MINING_THREADS") {
            if let Ok(threads) = threads.parse::<usize>() {
                self.mining.mining_threads = threads;
            }
        }
        if let Ok(addr) = std::env::var("QUBIT_MINING_ADDRESS") {
            self.mining.mining_address = Some(addr);
        }
        if let Ok(network) = std::env::var("QUBIT_NETWORK") {
            if let Ok(network) = network.parse() {
                self.network_type = network;
            }
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.p2p.validate()?;
        self.mining.validate()?;
        self.mempool.validate()?;
        self.consensus.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

/// Peer-to-peer policy. None of these are consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub max_peers: usize,
    /// Outbound sessions we keep trying to maintain via bootstrap dialing.
    pub target_peers: usize,
    /// Bytes per second we advertise in the handshake and enforce inbound.
    pub peer_rate_limit: u64,
    pub ban_duration_secs: u64,
    pub idle_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Hard cap on a single wire frame.
    pub max_frame_bytes: u32,
    pub bootstrap_interval_secs: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 9567,
            max_peers: 125,
            target_peers: 8,
            peer_rate_limit: 512 * 1024,
            ban_duration_secs: 3_600,
            idle_timeout_secs: 300,
            handshake_timeout_secs: 30,
            max_frame_bytes: 4 * 1024 * 1024,
            bootstrap_interval_secs: 60,
        }
    }
}

impl P2pConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.listen_port == 0 {
            return Err(CoreError::Config("p2p listen port cannot be 0".into()));
        }
        if self.max_peers == 0 {
            return Err(CoreError::Config("max_peers must be at least 1".into()));
        }
        if self.max_frame_bytes < 64 * 1024 {
            return Err(CoreError::Config("max_frame_bytes too small for a full block".into()));
        }
        Ok(())
    }
}

/// Miner parameters. `mining_threads = 0` disables mining entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub mining_threads: usize,
    /// Coinbase recipient in address string form. Required when threads > 0.
    pub mining_address: Option<String>,
    /// Hashes attempted between template-sequence checks.
    pub template_check_interval: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            mining_threads: 0,
            mining_address: None,
            template_check_interval: 4_096,
        }
    }
}

impl MiningConfig {
    /// Convenience for local mining with every available core.
    pub fn all_cores(address: String) -> Self {
        Self {
            mining_threads: num_cpus::get(),
            mining_address: Some(address),
            ..Default::default()
        }
    }

    fn validate(&self) -> crate::Result<()> {
        if self.mining_threads > 0 && self.mining_address.is_none() {
            return Err(CoreError::Config(
                "mining_address is required when mining_threads > 0".into(),
            ));
        }
        if self.template_check_interval == 0 {
            return Err(CoreError::Config("template_check_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Mempool admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    pub mempool_max_bytes: usize,
    /// Admission floor in quarks per byte.
    pub min_fee_per_byte: u64,
    /// Entries older than this are expired by housekeeping.
    pub tx_expiry_secs: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            mempool_max_bytes: 300 * 1024 * 1024,
            min_fee_per_byte: 1,
            tx_expiry_secs: 48 * 3_600,
        }
    }
}

impl MempoolConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.mempool_max_bytes < 1024 {
            return Err(CoreError::Config("mempool_max_bytes too small".into()));
        }
        Ok(())
    }
}

/// Consensus parameters. Identical across all peers on a network; changing
/// any of them forks the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub block_timing_seconds: u64,
    pub retarget_window: u64,
    /// Block intervals measured when retargeting.
    pub n_measurement: u64,
    /// Proportional controller gain; 1 applies the full measured ratio.
    pub kp: u64,
    pub reorg_limit: u64,
    pub halving_interval: u64,
    /// Subsidy of block 1, in quarks.
    pub initial_subsidy: u64,
    pub max_coin_supply: u64,
    pub allowed_timestamp_drift_secs: u64,
    pub max_block_bytes: usize,
    pub max_tx_bytes: usize,
    pub max_message_bytes: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            block_timing_seconds: 60,
            retarget_window: 2_016,
            n_measurement: 30,
            kp: 1,
            reorg_limit: 10_000,
            halving_interval: 1_051_200,
            initial_subsidy: 2 * QUARKS_PER_COIN + QUARKS_PER_COIN / 2,
            max_coin_supply: 30_000_000 * QUARKS_PER_COIN,
            allowed_timestamp_drift_secs: 7_200,
            max_block_bytes: 2_000_000,
            max_tx_bytes: 100_000,
            max_message_bytes: 4_096,
        }
    }
}

impl ConsensusConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.block_timing_seconds == 0 {
            return Err(CoreError::Config("block_timing_seconds must be positive".into()));
        }
        if self.retarget_window == 0 || self.n_measurement == 0 {
            return Err(CoreError::Config("retarget window and measurement must be positive".into()));
        }
        if self.kp == 0 {
            return Err(CoreError::Config("kp must be positive".into()));
        }
        if self.n_measurement > self.retarget_window {
            return Err(CoreError::Config(
                "n_measurement cannot exceed retarget_window".into(),
            ));
        }
        if self.max_tx_bytes > self.max_block_bytes {
            return Err(CoreError::Config("max_tx_bytes cannot exceed max_block_bytes".into()));
        }
        Ok(())
    }
}

/// On-disk layout knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Block files rotate once they grow past this.
    pub block_file_size: u64,
    /// Persist the mempool across restarts.
    pub persist_mempool: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_file_size: 128 * 1024 * 1024,
            persist_mempool: true,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> crate::Result<()> {
        if self.block_file_size < 1024 * 1024 {
            return Err(CoreError::Config("block_file_size must be at least 1 MiB".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::mainnet().validate().unwrap();
        Config::testnet().validate().unwrap();
        Config::dev().validate().unwrap();
    }

    #[test]
    fn mining_requires_address() {
        let mut config = Config::dev();
        config.mining.mining_threads = 2;
        assert!(config.validate().is_err());

        config.mining.mining_address = Some("Qsomething".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn network_params_are_distinct() {
        let mainnet = NetworkParams::for_network(NetworkType::Mainnet);
        let testnet = NetworkParams::for_network(NetworkType::Testnet);
        let dev = NetworkParams::for_network(NetworkType::Dev);
        assert_ne!(mainnet.magic, testnet.magic);
        assert_ne!(testnet.magic, dev.magic);
        assert_ne!(mainnet.address_version, dev.address_version);
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::dev();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network_type, NetworkType::Dev);
        assert_eq!(parsed.consensus.retarget_window, config.consensus.retarget_window);
    }
}
