use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use qubit_core::config::{Config, NetworkType};
use qubit_core::crypto::FalconKeypair;
use qubit_core::error::CoreError;
use qubit_core::node::Node;

#[derive(Parser)]
#[command(name = "qubit-node")]
#[command(about = "Quantum-resistant proof-of-work cryptocurrency node")]
struct Cli {
    /// Path to a TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value = "mainnet")]
    network: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data directory (genesis, config file, miner key).
    Init,
    /// Run the node.
    Start {
        /// Number of mining threads; 0 disables mining.
        #[arg(long)]
        mining_threads: Option<usize>,
        /// Coinbase recipient address for mined blocks.
        #[arg(long)]
        mining_address: Option<String>,
    },
    /// Print the chain state of an existing data directory.
    Status,
}

fn load_config(cli: &Cli) -> Result<Config, CoreError> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => match cli.network.parse::<NetworkType>()? {
            NetworkType::Mainnet => Config::mainnet(),
            NetworkType::Testnet => Config::testnet(),
            NetworkType::Dev => Config::dev(),
        },
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn exit_code_for(err: &CoreError) -> ExitCode {
    match err {
        CoreError::Config(_) | CoreError::Malformed(_) => ExitCode::from(1),
        CoreError::StoreCorruption(_) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::Init => init(&config),
        Commands::Start {
            mining_threads,
            mining_address,
        } => {
            if let Some(threads) = mining_threads {
                config.mining.mining_threads = threads;
            }
            if let Some(address) = mining_address {
                config.mining.mining_address = Some(address);
            }
            start(config).await
        }
        Commands::Status => status(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // A genesis mismatch means the data directory belongs to a
            // different network: a fatal consensus error.
            if matches!(&err, CoreError::Config(m) if m.contains("different network")) {
                eprintln!("fatal consensus mismatch: {err}");
                return ExitCode::from(3);
            }
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

fn init(config: &Config) -> Result<(), CoreError> {
    std::fs::create_dir_all(&config.data_dir)?;
    config.save_to_file(config.data_dir.join("qubit.toml"))?;

    let key_path = config.data_dir.join("miner.key");
    let keypair = FalconKeypair::load_or_create(&key_path)?;
    let address = keypair.address(config.params());

    let genesis = qubit_core::chain::ChainManager::genesis_block(config);
    println!("network:       {}", config.network_type.as_str());
    println!("data dir:      {}", config.data_dir.display());
    println!("genesis:       {}", hex::encode(genesis.hash()));
    println!("miner address: {address}");
    Ok(())
}

async fn start(config: Config) -> Result<(), CoreError> {
    let node = Node::start(config).await?;
    log::info!("node running; ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CoreError::Io(e.to_string()))?;
    node.shutdown();
    Ok(())
}

fn status(config: &Config) -> Result<(), CoreError> {
    use qubit_core::chain::ChainManager;
    use qubit_core::mempool::Mempool;
    use qubit_core::store::Store;
    use std::sync::Arc;

    let params = config.params();
    let store = Arc::new(Store::open(&config.data_dir, params.magic, &config.storage)?);
    let mempool = Arc::new(Mempool::new(
        config.mempool.clone(),
        config.consensus.clone(),
        params.address_version,
    ));
    let chain = ChainManager::open(store, config.clone(), mempool)?;

    let summary = chain.summary();
    println!("network:               {}", config.network_type.as_str());
    println!("height:                {}", summary.height);
    println!("tip:                   {}", hex::encode(summary.tip));
    println!("cumulative difficulty: {}", summary.cumulative_work);
    println!("orphans held:          {}", summary.orphans);
    Ok(())
}
