pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod difficulty;
pub mod error;
pub mod mempool;
pub mod miner;
pub mod node;
pub mod p2p;
pub mod state;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod wire;

pub use block::{Block, BlockHeader};
pub use chain::{BlockAccept, BlockSource, ChainManager};
pub use config::{Config, NetworkType};
pub use crypto::{Address, FalconKeypair, Hash32};
pub use error::CoreError;
pub use mempool::Mempool;
pub use miner::Miner;
pub use node::Node;
pub use state::AccountState;
pub use store::Store;
pub use transaction::{Transaction, TxKind};

pub type Result<T> = std::result::Result<T, CoreError>;
