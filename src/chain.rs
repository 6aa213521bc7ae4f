//! The chain manager: single writer of chain state.
//!
//! Every block enters through [`ChainManager::submit_block`], whether it
//! came from a peer, the syncer or the local miner, and is serialized
//! through one write lock.
//! Signature verification runs before the lock is taken; state application
//! and the store batch run under it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::U256;

use crate::block::{subsidy, Block, BlockHash, BlockHeader};
use crate::config::Config;
use crate::crypto::Address;
use crate::difficulty;
use crate::error::CoreError;
use crate::mempool::Mempool;
use crate::state::{revert_batch, AccountState, BlockContext, StateOverlay, WriteSet};
use crate::store::{keys, Store};
use crate::transaction::{Transaction, TxHash};
use crate::wire::{Reader, WireDecode, WireEncode, Writer};
use crate::Result;

const MAX_ORPHANS: usize = 1_000;
/// Ancestor hashes cached per block for fork walks and header serving.
const META_ANCESTORS: usize = 11;
const MAX_META_CHILDREN: usize = 512;

/// Consensus-tracking record stored per accepted block (`0x02‖hash`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMetaData {
    pub height: u64,
    /// Cumulative work from genesis, big-endian U256.
    pub cumulative_work: [u8; 32],
    pub child_hashes: Vec<BlockHash>,
    /// Up to [`META_ANCESTORS`] ancestor hashes, parent first.
    pub ancestor_hashes: Vec<BlockHash>,
    /// Arrival order; fork choice keeps the earlier branch on ties.
    pub arrival_seq: u64,
}

impl BlockMetaData {
    pub fn work(&self) -> U256 {
        U256::from_big_endian(&self.cumulative_work)
    }
}

impl WireEncode for BlockMetaData {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u64(self.height);
        out.put_hash(&self.cumulative_work);
        out.put_u32(self.child_hashes.len() as u32);
        for child in &self.child_hashes {
            out.put_hash(child);
        }
        out.put_u32(self.ancestor_hashes.len() as u32);
        for ancestor in &self.ancestor_hashes {
            out.put_hash(ancestor);
        }
        out.put_u64(self.arrival_seq);
    }
}

impl WireDecode for BlockMetaData {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockMetaData {
            height: reader.u64()?,
            cumulative_work: reader.hash()?,
            child_hashes: reader.vec(MAX_META_CHILDREN, |r| r.hash())?,
            ancestor_hashes: reader.vec(META_ANCESTORS, |r| r.hash())?,
            arrival_seq: reader.u64()?,
        })
    }
}

/// Persisted reorg checkpoint (`0x08`). Present only while a reorg is in
/// flight; a node that crashes mid-reorg finds it on restart and restores
/// the old chain before serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkState {
    pub fork_point: BlockHash,
    /// Old main-chain blocks, fork point first.
    pub old_path: Vec<BlockHash>,
    /// Candidate branch blocks, fork point first.
    pub new_path: Vec<BlockHash>,
}

impl WireEncode for ForkState {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_hash(&self.fork_point);
        out.put_u32(self.old_path.len() as u32);
        for hash in &self.old_path {
            out.put_hash(hash);
        }
        out.put_u32(self.new_path.len() as u32);
        for hash in &self.new_path {
            out.put_hash(hash);
        }
    }
}

impl WireDecode for ForkState {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(ForkState {
            fork_point: reader.hash()?,
            old_path: reader.vec(1_000_000, |r| r.hash())?,
            new_path: reader.vec(1_000_000, |r| r.hash())?,
        })
    }
}

/// Where a submitted block came from, for logging and peer scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Mined,
    Peer,
    Sync,
}

/// Outcome of a block submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAccept {
    /// Extended the main chain tip.
    Connected,
    /// Became the tip of a heavier branch; `depth` blocks were reverted.
    Reorged { depth: u64 },
    /// Stored on a side chain, tip unchanged.
    SideChain,
    /// Parent unknown; held in the orphan pool.
    Orphaned,
    /// Already known.
    Duplicate,
}

/// Mining template handed to workers. `seq` invalidates it: whenever the tip
/// moves the chain manager bumps the sequence and workers refetch.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub seq: u64,
}

#[derive(Debug, Clone)]
pub struct ChainSummary {
    pub tip: BlockHash,
    pub height: u64,
    pub cumulative_work: U256,
    pub orphans: usize,
}

struct ChainInner {
    tip: BlockHash,
    tip_height: u64,
    tip_work: U256,
    orphans: HashMap<BlockHash, Block>,
    orphan_order: VecDeque<BlockHash>,
    orphans_by_parent: HashMap<BlockHash, Vec<BlockHash>>,
    /// Headers proven invalid; anything extending them is refused outright.
    invalid: HashSet<BlockHash>,
    arrival_counter: u64,
}

pub struct ChainManager {
    store: Arc<Store>,
    config: Config,
    mempool: Arc<Mempool>,
    inner: RwLock<ChainInner>,
    template_seq: AtomicU64,
}

impl ChainManager {
    /// Open the chain: run store recovery, resolve any interrupted reorg,
    /// and create or verify the genesis block.
    pub fn open(store: Arc<Store>, config: Config, mempool: Arc<Mempool>) -> Result<Self> {
        let recovered_tip = store.recover()?;

        let manager = Self {
            store,
            config,
            mempool,
            inner: RwLock::new(ChainInner {
                tip: [0u8; 32],
                tip_height: 0,
                tip_work: U256::zero(),
                orphans: HashMap::new(),
                orphan_order: VecDeque::new(),
                orphans_by_parent: HashMap::new(),
                invalid: HashSet::new(),
                arrival_counter: 0,
            }),
            template_seq: AtomicU64::new(1),
        };

        match recovered_tip {
            None => manager.bootstrap_genesis()?,
            Some(tip) => {
                manager.resume_interrupted_reorg()?;
                let tip = manager.store.tip_hash()?.unwrap_or(tip);
                manager.adopt_tip(tip)?;
                manager.verify_genesis()?;
            }
        }
        Ok(manager)
    }

    /// The deterministic genesis block of the configured network.
    pub fn genesis_block(config: &Config) -> Block {
        let params = config.params();
        let genesis_addr = Address::from_seed(params.address_version, params.genesis_seed);
        let coinbase = Transaction::coinbase(genesis_addr, params.genesis_premine, 0);
        let header = BlockHeader {
            prev_hash: [0u8; 32],
            block_number: 0,
            timestamp: params.genesis_timestamp,
            merkle_root: Block::merkle_root(std::slice::from_ref(&coinbase)),
            difficulty_bits: params.genesis_bits,
            mining_nonce: 0,
            extra_nonce: 0,
            block_reward: params.genesis_premine,
            fee_reward: 0,
        };
        Block {
            header,
            transactions: vec![coinbase],
        }
    }

    fn bootstrap_genesis(&self) -> Result<()> {
        let genesis = Self::genesis_block(&self.config);
        let hash = genesis.hash();
        let work = difficulty::work_from_bits(genesis.header.difficulty_bits)?;

        let location = self.store.append_block(&genesis)?;
        let mut overlay = StateOverlay::new(&self.store);
        overlay.apply_coinbase(&genesis.transactions[0])?;

        let mut batch = sled::Batch::default();
        let write_set = overlay.into_commit(&mut batch);
        batch.insert(keys::write_set(&hash), write_set.encode());
        batch.insert(keys::block_location(&hash), location.encode());
        let meta = BlockMetaData {
            height: 0,
            cumulative_work: work_bytes(work),
            child_hashes: Vec::new(),
            ancestor_hashes: Vec::new(),
            arrival_seq: 0,
        };
        batch.insert(keys::block_meta(&hash), meta.encode());
        batch.insert(keys::height_index(0), hash.to_vec());
        batch.insert(keys::chain_tip(), hash.to_vec());
        self.store.commit(batch)?;

        self.adopt_tip(hash)?;
        log::info!(
            "genesis created for {}: {}",
            self.config.params().network.as_str(),
            hex::encode(hash)
        );
        Ok(())
    }

    fn verify_genesis(&self) -> Result<()> {
        let expected = Self::genesis_block(&self.config).hash();
        match self.store.header_hash_at(0)? {
            Some(found) if found == expected => Ok(()),
            Some(found) => Err(CoreError::Config(format!(
                "data directory belongs to a different network: genesis {} != {}",
                hex::encode(found),
                hex::encode(expected)
            ))),
            None => Err(CoreError::StoreCorruption("genesis missing from index".into())),
        }
    }

    fn adopt_tip(&self, tip: BlockHash) -> Result<()> {
        let meta = self.meta(&tip)?.ok_or_else(|| {
            CoreError::StoreCorruption("tip has no metadata record".into())
        })?;
        let mut inner = self.inner.write();
        inner.tip = tip;
        inner.tip_height = meta.height;
        inner.tip_work = meta.work();
        inner.arrival_counter = inner.arrival_counter.max(meta.arrival_seq + 1);
        Ok(())
    }

    /// Abort a reorg that was interrupted by a crash: walk the tip back to
    /// the fork point via write-sets, then re-apply the old path.
    fn resume_interrupted_reorg(&self) -> Result<()> {
        let Some(bytes) = self.store.get(&keys::fork_state())? else {
            return Ok(());
        };
        let fork = ForkState::decode(&bytes)?;
        log::warn!(
            "interrupted reorg found (fork point {}), restoring previous chain",
            hex::encode(fork.fork_point)
        );

        let mut tip = self
            .store
            .tip_hash()?
            .ok_or_else(|| CoreError::StoreCorruption("no tip during reorg recovery".into()))?;
        while tip != fork.fork_point {
            let block = self
                .store
                .block_by_hash(&tip)?
                .ok_or_else(|| CoreError::StoreCorruption("tip body missing".into()))?;
            self.revert_main(&block)?;
            tip = block.header.prev_hash;
        }
        for hash in &fork.old_path {
            if *hash == fork.fork_point {
                continue;
            }
            let block = self
                .store
                .block_by_hash(hash)?
                .ok_or_else(|| CoreError::StoreCorruption("old-path body missing".into()))?;
            self.connect_main(&block)?;
        }
        self.store.delete(&keys::fork_state())?;
        self.store.flush()?;
        Ok(())
    }

    // -- public read surface -------------------------------------------------

    pub fn tip(&self) -> (BlockHash, u64) {
        let inner = self.inner.read();
        (inner.tip, inner.tip_height)
    }

    pub fn cumulative_difficulty(&self) -> U256 {
        self.inner.read().tip_work
    }

    pub fn summary(&self) -> ChainSummary {
        let inner = self.inner.read();
        ChainSummary {
            tip: inner.tip,
            height: inner.tip_height,
            cumulative_work: inner.tip_work,
            orphans: inner.orphans.len(),
        }
    }

    pub fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>> {
        self.store.block_by_hash(hash)
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.store.header_hash_at(height)? {
            Some(hash) => self.store.block_by_hash(&hash),
            None => Ok(None),
        }
    }

    pub fn header_at(&self, height: u64) -> Result<Option<BlockHeader>> {
        Ok(self.block_by_height(height)?.map(|block| block.header))
    }

    pub fn has_block(&self, hash: &BlockHash) -> bool {
        matches!(self.meta(hash), Ok(Some(_)))
    }

    /// Main-chain header hashes `[start, start+count)`, for header-first
    /// sync windows.
    pub fn header_hashes_from(&self, start: u64, count: u64) -> Result<Vec<BlockHash>> {
        let mut hashes = Vec::new();
        for height in start..start.saturating_add(count) {
            match self.store.header_hash_at(height)? {
                Some(hash) => hashes.push(hash),
                None => break,
            }
        }
        Ok(hashes)
    }

    pub fn meta(&self, hash: &BlockHash) -> Result<Option<BlockMetaData>> {
        match self.store.get(&keys::block_meta(hash))? {
            Some(bytes) => Ok(Some(BlockMetaData::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Account record at the current tip; absent addresses read as the
    /// default-zero account.
    pub fn account_state(&self, addr: &Address) -> Result<AccountState> {
        match self.store.get(&keys::account(addr))? {
            Some(bytes) => Ok(AccountState::decode(&bytes)?),
            None => Ok(AccountState::default()),
        }
    }

    /// Convenience for the balance of an address at the tip.
    pub fn balance(&self, addr: &Address) -> u64 {
        self.account_state(addr).map(|acct| acct.balance).unwrap_or(0)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- transactions --------------------------------------------------------

    /// Mempool admission against the current tip.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<TxHash> {
        let (_, height) = self.tip();
        self.mempool.admit(tx, &self.store, height)
    }

    // -- mining --------------------------------------------------------------

    pub fn template_seq(&self) -> u64 {
        self.template_seq.load(Ordering::Acquire)
    }

    fn bump_template_seq(&self) {
        self.template_seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Build a mining template on the current tip: mempool selection,
    /// coinbase, merkle root. Workers only vary the header nonces.
    pub fn template(&self, coinbase_recipient: Address) -> Result<BlockTemplate> {
        let seq = self.template_seq();
        let (tip, tip_height) = self.tip();
        let tip_header = self
            .block_by_hash(&tip)?
            .ok_or(CoreError::BlockNotFound)?
            .header;

        let consensus = &self.config.consensus;
        let height = tip_height + 1;
        let bits = self.next_difficulty_bits(&tip)?;

        // Leave generous room for the coinbase.
        let budget = consensus.max_block_bytes.saturating_sub(4_096);
        let txs = self.mempool.take_for_block(budget, crate::block::MAX_BLOCK_TXS - 1);
        let fees: u64 = txs.iter().map(|tx| tx.fee).sum();
        let reward = subsidy(height, consensus);

        let mut transactions =
            vec![Transaction::coinbase(coinbase_recipient, reward + fees, height)];
        transactions.extend(txs);

        let now = chrono::Utc::now().timestamp() as u64;
        let min_time = self.median_time_past(&tip)? + 1;
        let header = BlockHeader {
            prev_hash: tip,
            block_number: height,
            timestamp: now.max(min_time).max(tip_header.timestamp),
            merkle_root: Block::merkle_root(&transactions),
            difficulty_bits: bits,
            mining_nonce: 0,
            extra_nonce: 0,
            block_reward: reward,
            fee_reward: fees,
        };
        Ok(BlockTemplate {
            block: Block {
                header,
                transactions,
            },
            seq,
        })
    }

    // -- block submission ----------------------------------------------------

    /// Validate and place a block. Runs the CPU-heavy checks (structure,
    /// PoW, signatures) before taking the write lock.
    pub fn submit_block(&self, block: Block, source: BlockSource) -> Result<BlockAccept> {
        let hash = block.hash();

        if self.has_block(&hash) {
            return Ok(BlockAccept::Duplicate);
        }
        {
            let inner = self.inner.read();
            if inner.invalid.contains(&hash) || inner.invalid.contains(&block.header.prev_hash) {
                return Err(CoreError::InvalidBranch);
            }
            if inner.orphans.contains_key(&hash) {
                return Ok(BlockAccept::Duplicate);
            }
        }

        block.validate_structure(&self.config.consensus)?;
        if !difficulty::meets_target(&hash, block.header.difficulty_bits)? {
            self.mark_invalid(hash);
            return Err(CoreError::BadPoW);
        }
        // Lock-free signature pass; the stateful half runs under the lock.
        for tx in &block.transactions {
            if !tx.verify_signature() {
                self.mark_invalid(hash);
                return Err(CoreError::InvalidSignature);
            }
        }

        let accept = self.place_block(block, hash)?;
        log::info!(
            "block {} from {source:?}: {accept:?}",
            hex::encode(hash)
        );

        // Whatever just connected may free orphans.
        if matches!(accept, BlockAccept::Connected | BlockAccept::Reorged { .. } | BlockAccept::SideChain)
        {
            self.drain_orphans(hash)?;
        }
        Ok(accept)
    }

    /// Contextual placement under the write lock.
    fn place_block(&self, block: Block, hash: BlockHash) -> Result<BlockAccept> {
        if self.has_block(&hash) {
            return Ok(BlockAccept::Duplicate);
        }
        let parent_hash = block.header.prev_hash;
        let Some(parent_meta) = self.meta(&parent_hash)? else {
            self.hold_orphan(hash, block);
            return Ok(BlockAccept::Orphaned);
        };

        // Height, difficulty schedule and timestamp are validated relative
        // to the parent's branch.
        let expected_height = parent_meta.height + 1;
        if block.header.block_number != expected_height {
            self.mark_invalid(hash);
            return Err(CoreError::BadHeight {
                expected: expected_height,
                got: block.header.block_number,
            });
        }
        if block.header.block_reward != subsidy(expected_height, &self.config.consensus) {
            self.mark_invalid(hash);
            return Err(CoreError::InvalidBlock("declared subsidy is wrong".into()));
        }
        let expected_bits = self.next_difficulty_bits(&parent_hash)?;
        if block.header.difficulty_bits != expected_bits {
            self.mark_invalid(hash);
            return Err(CoreError::InvalidBlock(format!(
                "difficulty bits {:#010x}, expected {expected_bits:#010x}",
                block.header.difficulty_bits
            )));
        }
        self.validate_timestamp(&block.header, &parent_hash)?;

        let work = difficulty::work_from_bits(block.header.difficulty_bits)?;
        let cumulative = parent_meta.work() + work;

        let mut inner = self.inner.write();

        // Store the body and metadata regardless of fork position.
        let location = self.store.append_block(&block)?;
        let mut batch = sled::Batch::default();
        batch.insert(keys::block_location(&hash), location.encode());

        let mut ancestors = Vec::with_capacity(META_ANCESTORS);
        ancestors.push(parent_hash);
        ancestors.extend(
            parent_meta
                .ancestor_hashes
                .iter()
                .take(META_ANCESTORS - 1)
                .copied(),
        );
        let arrival_seq = inner.arrival_counter;
        inner.arrival_counter += 1;
        let meta = BlockMetaData {
            height: expected_height,
            cumulative_work: work_bytes(cumulative),
            child_hashes: Vec::new(),
            ancestor_hashes: ancestors,
            arrival_seq,
        };
        batch.insert(keys::block_meta(&hash), meta.encode());

        let mut parent_meta = parent_meta;
        if !parent_meta.child_hashes.contains(&hash) {
            parent_meta.child_hashes.push(hash);
            batch.insert(keys::block_meta(&parent_hash), parent_meta.encode());
        }
        self.store.commit(batch)?;

        // Fork choice: strictly heavier wins; ties keep the incumbent.
        if cumulative <= inner.tip_work {
            return Ok(BlockAccept::SideChain);
        }

        if parent_hash == inner.tip {
            if let Err(err) = self.connect_main(&block) {
                inner.invalid.insert(hash);
                return Err(CoreError::InvalidBlock(format!(
                    "state application failed: {err}"
                )));
            }
            inner.tip = hash;
            inner.tip_height = expected_height;
            inner.tip_work = cumulative;
            drop(inner);
            self.bump_template_seq();
            let (_, height) = self.tip();
            self.mempool.on_block_connected(&block, &self.store, height);
            Ok(BlockAccept::Connected)
        } else {
            let depth = self.reorg_to(&mut inner, hash, cumulative)?;
            drop(inner);
            self.bump_template_seq();
            Ok(BlockAccept::Reorged { depth })
        }
    }

    /// Reorganize the main chain onto the branch ending at `new_tip`.
    fn reorg_to(
        &self,
        inner: &mut ChainInner,
        new_tip: BlockHash,
        new_work: U256,
    ) -> Result<u64> {
        let (fork_point, old_path, new_path) = self.find_fork(inner.tip, new_tip)?;
        let depth = old_path.len() as u64;
        if depth > self.config.consensus.reorg_limit {
            return Err(CoreError::ReorgTooDeep {
                depth,
                limit: self.config.consensus.reorg_limit,
            });
        }
        log::info!(
            "reorg: fork point {}, reverting {} blocks, applying {}",
            hex::encode(fork_point),
            old_path.len(),
            new_path.len()
        );

        // Checkpoint first so a crash anywhere below is recoverable.
        let fork = ForkState {
            fork_point,
            old_path: old_path.clone(),
            new_path: new_path.clone(),
        };
        self.store.put(&keys::fork_state(), &fork.encode())?;
        self.store.flush()?;

        // Revert the old tail, remembering transactions to return to the
        // mempool.
        let mut returned: Vec<Transaction> = Vec::new();
        for hash in old_path.iter().rev() {
            let block = self
                .store
                .block_by_hash(hash)?
                .ok_or_else(|| CoreError::StoreCorruption("old-path body missing".into()))?;
            returned.extend(block.transactions.iter().skip(1).cloned());
            self.revert_main(&block)?;
        }

        // Apply the new branch; on failure roll everything back and damn
        // the offending header.
        let mut applied: Vec<BlockHash> = Vec::new();
        for hash in &new_path {
            let block = self
                .store
                .block_by_hash(hash)?
                .ok_or_else(|| CoreError::StoreCorruption("new-path body missing".into()))?;
            match self.connect_main(&block) {
                Ok(()) => applied.push(*hash),
                Err(err) => {
                    log::warn!(
                        "reorg aborted: block {} failed to apply ({err}); restoring old chain",
                        hex::encode(hash)
                    );
                    for done in applied.iter().rev() {
                        let block = self
                            .store
                            .block_by_hash(done)?
                            .ok_or_else(|| CoreError::StoreCorruption("rollback body missing".into()))?;
                        self.revert_main(&block)?;
                    }
                    for old in &old_path {
                        let block = self
                            .store
                            .block_by_hash(old)?
                            .ok_or_else(|| CoreError::StoreCorruption("old-path body missing".into()))?;
                        self.connect_main(&block)?;
                    }
                    self.store.delete(&keys::fork_state())?;
                    self.store.flush()?;
                    inner.invalid.insert(*hash);
                    return Err(CoreError::InvalidBlock(format!(
                        "branch block {} failed state application: {err}",
                        hex::encode(hash)
                    )));
                }
            }
        }

        self.store.delete(&keys::fork_state())?;
        self.store.flush()?;

        let new_meta = self
            .meta(&new_tip)?
            .ok_or_else(|| CoreError::StoreCorruption("new tip lost its metadata".into()))?;
        inner.tip = new_tip;
        inner.tip_height = new_meta.height;
        inner.tip_work = new_work;

        let tip_height = inner.tip_height;
        self.mempool.on_reorg(returned, &self.store, tip_height);
        Ok(depth)
    }

    /// Walk parents to the lowest common ancestor of `a` (current tip) and
    /// `b` (candidate). Returns (fork point, old path, new path), paths
    /// ordered fork-point-first and excluding the fork point itself.
    fn find_fork(
        &self,
        a: BlockHash,
        b: BlockHash,
    ) -> Result<(BlockHash, Vec<BlockHash>, Vec<BlockHash>)> {
        let mut a_cursor = a;
        let mut b_cursor = b;
        let mut a_meta = self.require_meta(&a_cursor)?;
        let mut b_meta = self.require_meta(&b_cursor)?;
        let mut old_path = VecDeque::new();
        let mut new_path = VecDeque::new();

        while b_meta.height > a_meta.height {
            new_path.push_front(b_cursor);
            b_cursor = self.parent_of(&b_meta, &b_cursor)?;
            b_meta = self.require_meta(&b_cursor)?;
        }
        while a_meta.height > b_meta.height {
            old_path.push_front(a_cursor);
            a_cursor = self.parent_of(&a_meta, &a_cursor)?;
            a_meta = self.require_meta(&a_cursor)?;
        }
        while a_cursor != b_cursor {
            old_path.push_front(a_cursor);
            new_path.push_front(b_cursor);
            a_cursor = self.parent_of(&a_meta, &a_cursor)?;
            b_cursor = self.parent_of(&b_meta, &b_cursor)?;
            a_meta = self.require_meta(&a_cursor)?;
            b_meta = self.require_meta(&b_cursor)?;
        }
        Ok((a_cursor, old_path.into(), new_path.into()))
    }

    fn require_meta(&self, hash: &BlockHash) -> Result<BlockMetaData> {
        self.meta(hash)?
            .ok_or_else(|| CoreError::StoreCorruption(format!("metadata missing for {}", hex::encode(hash))))
    }

    fn parent_of(&self, meta: &BlockMetaData, hash: &BlockHash) -> Result<BlockHash> {
        if let Some(parent) = meta.ancestor_hashes.first() {
            return Ok(*parent);
        }
        // Genesis has no ancestors; anything else must.
        if meta.height == 0 {
            return Ok(*hash);
        }
        Err(CoreError::StoreCorruption("block metadata lost its parent".into()))
    }

    /// Apply `block` as the new main tip: state overlay, write-set, height
    /// index and tip pointer in one atomic batch.
    fn connect_main(&self, block: &Block) -> Result<()> {
        let hash = block.hash();
        let ctx = BlockContext {
            height: block.height(),
            address_version: self.config.params().address_version,
        };
        let mut overlay = StateOverlay::new(&self.store);
        overlay.apply_block(block, &ctx)?;

        let mut batch = sled::Batch::default();
        let write_set = overlay.into_commit(&mut batch);
        batch.insert(keys::write_set(&hash), write_set.encode());
        batch.insert(keys::height_index(block.height()), hash.to_vec());
        batch.insert(keys::chain_tip(), hash.to_vec());
        self.store.commit(batch)
    }

    /// Exact inverse of [`Self::connect_main`], driven by the stored
    /// write-set.
    fn revert_main(&self, block: &Block) -> Result<()> {
        let hash = block.hash();
        let bytes = self
            .store
            .get(&keys::write_set(&hash))?
            .ok_or_else(|| CoreError::StoreCorruption("write-set missing for revert".into()))?;
        let write_set = WriteSet::decode(&bytes)?;

        let mut batch = revert_batch(&write_set);
        batch.remove(keys::write_set(&hash));
        batch.remove(keys::height_index(block.height()));
        batch.insert(keys::chain_tip(), block.header.prev_hash.to_vec());
        self.store.commit(batch)
    }

    // -- contextual checks ---------------------------------------------------

    /// Difficulty bits a child of `parent_hash` must carry.
    pub fn next_difficulty_bits(&self, parent_hash: &BlockHash) -> Result<u32> {
        let parent = self
            .store
            .block_by_hash(parent_hash)?
            .ok_or(CoreError::BlockNotFound)?
            .header;
        let consensus = &self.config.consensus;
        let next_height = parent.block_number + 1;
        if next_height == 0 || next_height % consensus.retarget_window != 0 {
            return Ok(parent.difficulty_bits);
        }

        // Span of the last n_measurement intervals ending at the parent.
        let intervals = consensus.n_measurement.min(parent.block_number);
        if intervals == 0 {
            return Ok(parent.difficulty_bits);
        }
        let mut cursor = parent;
        for _ in 0..intervals {
            cursor = self
                .store
                .block_by_hash(&cursor.prev_hash)?
                .ok_or(CoreError::BlockNotFound)?
                .header;
        }
        let actual = parent.timestamp.saturating_sub(cursor.timestamp);
        difficulty::retarget(
            parent.difficulty_bits,
            actual,
            consensus,
            self.config.params().genesis_bits,
        )
    }

    /// Median timestamp of up to the last 11 blocks ending at `hash`.
    fn median_time_past(&self, hash: &BlockHash) -> Result<u64> {
        let mut times = Vec::with_capacity(META_ANCESTORS);
        let mut cursor = *hash;
        for _ in 0..META_ANCESTORS {
            let header = match self.store.block_by_hash(&cursor)? {
                Some(block) => block.header,
                None => break,
            };
            times.push(header.timestamp);
            if header.block_number == 0 {
                break;
            }
            cursor = header.prev_hash;
        }
        if times.is_empty() {
            return Err(CoreError::BlockNotFound);
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    fn validate_timestamp(&self, header: &BlockHeader, parent_hash: &BlockHash) -> Result<()> {
        let median = self.median_time_past(parent_hash)?;
        if header.timestamp <= median {
            return Err(CoreError::BadTimestamp(format!(
                "timestamp {} not past median {median}",
                header.timestamp
            )));
        }
        let now = chrono::Utc::now().timestamp() as u64;
        let drift = self.config.consensus.allowed_timestamp_drift_secs;
        if header.timestamp > now + drift {
            return Err(CoreError::BadTimestamp(format!(
                "timestamp {} more than {drift}s in the future",
                header.timestamp
            )));
        }
        Ok(())
    }

    // -- orphans -------------------------------------------------------------

    fn hold_orphan(&self, hash: BlockHash, block: Block) {
        let mut inner = self.inner.write();
        while inner.orphan_order.len() >= MAX_ORPHANS {
            if let Some(evicted) = inner.orphan_order.pop_front() {
                if let Some(block) = inner.orphans.remove(&evicted) {
                    if let Some(siblings) = inner.orphans_by_parent.get_mut(&block.header.prev_hash)
                    {
                        siblings.retain(|h| *h != evicted);
                    }
                }
            }
        }
        let parent = block.header.prev_hash;
        inner.orphans.insert(hash, block);
        inner.orphan_order.push_back(hash);
        inner.orphans_by_parent.entry(parent).or_default().push(hash);
        log::debug!("orphan held: {} (parent {})", hex::encode(hash), hex::encode(parent));
    }

    /// Resubmit orphans whose missing parent just arrived, cascading.
    fn drain_orphans(&self, connected: BlockHash) -> Result<()> {
        let mut ready = vec![connected];
        while let Some(parent) = ready.pop() {
            let children: Vec<(BlockHash, Block)> = {
                let mut inner = self.inner.write();
                let Some(hashes) = inner.orphans_by_parent.remove(&parent) else {
                    continue;
                };
                hashes
                    .into_iter()
                    .filter_map(|hash| {
                        inner.orphan_order.retain(|h| *h != hash);
                        inner.orphans.remove(&hash).map(|block| (hash, block))
                    })
                    .collect()
            };
            for (hash, block) in children {
                match self.submit_block(block, BlockSource::Peer) {
                    Ok(BlockAccept::Connected | BlockAccept::Reorged { .. } | BlockAccept::SideChain) => {
                        ready.push(hash);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("orphan {} rejected on retry: {err}", hex::encode(hash));
                    }
                }
            }
        }
        Ok(())
    }

    fn mark_invalid(&self, hash: BlockHash) {
        self.inner.write().invalid.insert(hash);
    }
}

fn work_bytes(work: U256) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    work.to_big_endian(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MempoolConfig, NetworkParams, NetworkType, StorageConfig};
    use crate::crypto::FalconKeypair;
    use crate::state::AccountState;
    use crate::transaction::{Output, TxKind};

    struct Harness {
        _dir: tempfile::TempDir,
        chain: ChainManager,
        params: &'static NetworkParams,
    }

    fn dev_config() -> Config {
        let mut config = Config::dev();
        config.mempool.min_fee_per_byte = 0;
        config
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(dev_config())
        }

        fn with_config(config: Config) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let params = NetworkParams::for_network(config.network_type);
            let store = Arc::new(
                Store::open(dir.path(), params.magic, &StorageConfig::default()).unwrap(),
            );
            let mempool = Arc::new(Mempool::new(
                config.mempool.clone(),
                config.consensus.clone(),
                params.address_version,
            ));
            let chain = ChainManager::open(store, config, mempool).unwrap();
            Self {
                _dir: dir,
                chain,
                params,
            }
        }

        fn miner(&self) -> Address {
            Address::from_seed(self.params.address_version, "test-miner")
        }

        /// Mine a child of `parent` carrying `txs`, spacing timestamps by
        /// `spacing` seconds.
        fn build_child(
            &self,
            parent: &BlockHash,
            txs: Vec<Transaction>,
            miner: Address,
            spacing: u64,
        ) -> Block {
            let parent_block = self.chain.block_by_hash(parent).unwrap().unwrap();
            let height = parent_block.height() + 1;
            let consensus = &self.chain.config().consensus;
            let bits = self.chain.next_difficulty_bits(parent).unwrap();
            let fees: u64 = txs.iter().map(|tx| tx.fee).sum();
            let reward = subsidy(height, consensus);

            let mut transactions = vec![Transaction::coinbase(miner, reward + fees, height)];
            transactions.extend(txs);

            let mut block = Block {
                header: BlockHeader {
                    prev_hash: *parent,
                    block_number: height,
                    timestamp: parent_block.header.timestamp + spacing,
                    merkle_root: Block::merkle_root(&transactions),
                    difficulty_bits: bits,
                    mining_nonce: 0,
                    extra_nonce: 0,
                    block_reward: reward,
                    fee_reward: fees,
                },
                transactions,
            };
            while !difficulty::meets_target(&block.hash(), bits).unwrap() {
                block.header.mining_nonce += 1;
            }
            block
        }

        fn mine_on_tip(&self, txs: Vec<Transaction>) -> Block {
            let (tip, _) = self.chain.tip();
            self.build_child(&tip, txs, self.miner(), 60)
        }

        fn fund(&self, addr: &Address, balance: u64) {
            let account = AccountState {
                balance,
                ..Default::default()
            };
            self.chain
                .store()
                .put(&keys::account(addr), &account.encode())
                .unwrap();
        }

        fn balance(&self, addr: &Address) -> u64 {
            self.chain.balance(addr)
        }
    }

    fn transfer(
        keypair: &FalconKeypair,
        params: &NetworkParams,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
    ) -> Transaction {
        let mut tx = Transaction::new(
            keypair.address(params),
            fee,
            nonce,
            TxKind::Transfer {
                outputs: vec![Output {
                    recipient: to,
                    amount,
                }],
                message: Vec::new(),
            },
        );
        tx.sign(keypair).unwrap();
        tx
    }

    #[test]
    fn genesis_boot() {
        let h = Harness::new();
        let (tip, height) = h.chain.tip();
        assert_eq!(height, 0);
        assert_eq!(tip, ChainManager::genesis_block(h.chain.config()).hash());

        let genesis_addr = Address::from_seed(h.params.address_version, h.params.genesis_seed);
        assert_eq!(h.balance(&genesis_addr), h.params.genesis_premine);
        assert_eq!(
            h.chain.cumulative_difficulty(),
            difficulty::work_from_bits(h.params.genesis_bits).unwrap()
        );
    }

    #[test]
    fn genesis_is_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = dev_config();
        let params = NetworkParams::for_network(config.network_type);
        let open = |dir: &std::path::Path| {
            let store =
                Arc::new(Store::open(dir, params.magic, &StorageConfig::default()).unwrap());
            let mempool = Arc::new(Mempool::new(
                MempoolConfig::default(),
                config.consensus.clone(),
                params.address_version,
            ));
            ChainManager::open(store, config.clone(), mempool).unwrap()
        };
        let first_tip = open(dir.path()).tip();
        let second_tip = open(dir.path()).tip();
        assert_eq!(first_tip, second_tip);
    }

    #[test]
    fn connect_blocks_and_pay_miner() {
        let h = Harness::new();
        let block1 = h.mine_on_tip(vec![]);
        assert_eq!(
            h.chain.submit_block(block1.clone(), BlockSource::Mined).unwrap(),
            BlockAccept::Connected
        );
        let (tip, height) = h.chain.tip();
        assert_eq!(height, 1);
        assert_eq!(tip, block1.hash());
        assert_eq!(
            h.balance(&h.miner()),
            subsidy(1, &h.chain.config().consensus)
        );

        assert_eq!(
            h.chain.submit_block(block1, BlockSource::Peer).unwrap(),
            BlockAccept::Duplicate
        );
    }

    #[test]
    fn single_transfer_scenario() {
        let h = Harness::new();
        let alice = FalconKeypair::generate();
        let alice_addr = alice.address(h.params);
        let bob = Address::from_seed(h.params.address_version, "bob");
        let carol = Address::from_seed(h.params.address_version, "carol");
        h.fund(&alice_addr, 100);

        let tx = transfer(&alice, h.params, bob, 30, 1, 1);
        h.chain.submit_transaction(tx.clone()).unwrap();

        let (tip, _) = h.chain.tip();
        let block = h.build_child(&tip, vec![tx.clone()], carol, 60);
        h.chain.submit_block(block, BlockSource::Mined).unwrap();

        assert_eq!(h.balance(&alice_addr), 69);
        assert_eq!(h.balance(&bob), 30);
        assert_eq!(
            h.balance(&carol),
            subsidy(1, &h.chain.config().consensus) + 1
        );

        // The mempool dropped the confirmed transaction.
        assert_eq!(h.chain.mempool().stats().transactions, 0);

        // Replaying the same signing key is refused at admission.
        let replay = transfer(&alice, h.params, bob, 5, 1, 2);
        assert_eq!(
            h.chain.submit_transaction(replay),
            Err(CoreError::ReusedSigningKey)
        );
    }

    #[test]
    fn bad_pow_rejected() {
        let h = Harness::new();
        // Bump the nonce after mining until the hash misses the target.
        let mut block = h.mine_on_tip(vec![]);
        loop {
            block.header.mining_nonce += 1;
            if !difficulty::meets_target(&block.hash(), block.header.difficulty_bits).unwrap() {
                break;
            }
        }
        assert_eq!(
            h.chain.submit_block(block, BlockSource::Peer),
            Err(CoreError::BadPoW)
        );
    }

    #[test]
    fn wrong_height_and_subsidy_rejected() {
        let h = Harness::new();
        let mut wrong_height = h.mine_on_tip(vec![]);
        wrong_height.header.block_number = 5;
        if let TxKind::Coinbase { .. } = wrong_height.transactions[0].kind {
            wrong_height.transactions[0].nonce = 5;
        }
        wrong_height.header.merkle_root = Block::merkle_root(&wrong_height.transactions);
        while !difficulty::meets_target(&wrong_height.hash(), wrong_height.header.difficulty_bits)
            .unwrap()
        {
            wrong_height.header.mining_nonce += 1;
        }
        assert!(matches!(
            h.chain.submit_block(wrong_height, BlockSource::Peer),
            Err(CoreError::BadHeight { .. })
        ));
    }

    #[test]
    fn orphan_then_connect() {
        let h = Harness::new();
        let block1 = h.mine_on_tip(vec![]);
        let block2 = h.build_child(&block1.hash(), vec![], h.miner(), 60);

        assert_eq!(
            h.chain.submit_block(block2.clone(), BlockSource::Peer).unwrap(),
            BlockAccept::Orphaned
        );
        assert_eq!(h.chain.tip().1, 0);

        // Parent arrives; the orphan connects behind it.
        h.chain.submit_block(block1, BlockSource::Peer).unwrap();
        assert_eq!(h.chain.tip(), (block2.hash(), 2));
    }

    #[test]
    fn reorg_depth_two() {
        let h = Harness::new();
        let miner_b = Address::from_seed(h.params.address_version, "competing-miner");
        let consensus = h.chain.config().consensus.clone();

        // Main chain: g -> a1 -> a2 -> a3.
        let a1 = h.mine_on_tip(vec![]);
        h.chain.submit_block(a1.clone(), BlockSource::Mined).unwrap();
        let a2 = h.build_child(&a1.hash(), vec![], h.miner(), 60);
        h.chain.submit_block(a2.clone(), BlockSource::Mined).unwrap();
        let a3 = h.build_child(&a2.hash(), vec![], h.miner(), 60);
        h.chain.submit_block(a3.clone(), BlockSource::Mined).unwrap();
        assert_eq!(h.chain.tip(), (a3.hash(), 3));

        // Competing branch from a1. b3 ties a3 on cumulative work: the
        // incumbent keeps the tip. b4 is strictly heavier and wins.
        let b2 = h.build_child(&a1.hash(), vec![], miner_b, 61);
        assert_eq!(
            h.chain.submit_block(b2.clone(), BlockSource::Peer).unwrap(),
            BlockAccept::SideChain
        );
        let b3 = h.build_child(&b2.hash(), vec![], miner_b, 60);
        assert_eq!(
            h.chain.submit_block(b3.clone(), BlockSource::Peer).unwrap(),
            BlockAccept::SideChain
        );
        assert_eq!(h.chain.tip(), (a3.hash(), 3));

        let b4 = h.build_child(&b3.hash(), vec![], miner_b, 60);
        assert_eq!(
            h.chain.submit_block(b4.clone(), BlockSource::Peer).unwrap(),
            BlockAccept::Reorged { depth: 2 }
        );

        assert_eq!(h.chain.tip(), (b4.hash(), 4));
        // a2 and a3 subsidies were reverted; only a1's remains.
        assert_eq!(h.balance(&h.miner()), subsidy(1, &consensus));
        assert_eq!(
            h.balance(&miner_b),
            subsidy(2, &consensus) + subsidy(3, &consensus) + subsidy(4, &consensus)
        );
        // ForkState cleared, height index re-pointed at the new branch.
        assert_eq!(h.chain.store().get(&keys::fork_state()).unwrap(), None);
        assert_eq!(h.chain.store().header_hash_at(2).unwrap(), Some(b2.hash()));
        assert_eq!(h.chain.store().header_hash_at(3).unwrap(), Some(b3.hash()));
        assert_eq!(h.chain.store().header_hash_at(4).unwrap(), Some(b4.hash()));
    }

    #[test]
    fn reorg_failure_restores_old_chain_and_marks_branch() {
        let h = Harness::new();
        let miner_b = Address::from_seed(h.params.address_version, "competing-miner");
        let alice = FalconKeypair::generate();
        let alice_addr = alice.address(h.params);
        h.fund(&alice_addr, 100);

        // Main chain: g -> a1 -> a2.
        let a1 = h.mine_on_tip(vec![]);
        h.chain.submit_block(a1.clone(), BlockSource::Mined).unwrap();
        let a2 = h.build_child(&a1.hash(), vec![], h.miner(), 60);
        h.chain.submit_block(a2.clone(), BlockSource::Mined).unwrap();

        // Heavier branch from a1 whose second block overspends: it passes
        // structure and PoW, and fails only at state application mid-reorg.
        let overspend = transfer(&alice, h.params, alice_addr, 1_000, 1, 1);
        let b2 = h.build_child(&a1.hash(), vec![], miner_b, 61);
        assert_eq!(
            h.chain.submit_block(b2.clone(), BlockSource::Peer).unwrap(),
            BlockAccept::SideChain
        );
        let b3 = h.build_child(&b2.hash(), vec![overspend], miner_b, 60);
        let b3_hash = b3.hash();

        let err = h.chain.submit_block(b3, BlockSource::Peer).unwrap_err();
        assert!(matches!(err, CoreError::InvalidBlock(_)));

        // Old chain restored exactly.
        assert_eq!(h.chain.tip(), (a2.hash(), 2));
        assert_eq!(h.balance(&alice_addr), 100);
        assert_eq!(h.chain.store().get(&keys::fork_state()).unwrap(), None);
        assert_eq!(h.chain.store().header_hash_at(2).unwrap(), Some(a2.hash()));

        // The offending header is damned: extending it is refused outright.
        let b4 = h.build_child(&b3_hash, vec![], miner_b, 60);
        assert_eq!(
            h.chain.submit_block(b4, BlockSource::Peer),
            Err(CoreError::InvalidBranch)
        );
    }

    #[test]
    fn reorg_too_deep_refused() {
        let mut config = dev_config();
        config.consensus.reorg_limit = 1;
        let h = Harness::with_config(config);
        let miner_b = Address::from_seed(h.params.address_version, "competing-miner");

        let a1 = h.mine_on_tip(vec![]);
        h.chain.submit_block(a1.clone(), BlockSource::Mined).unwrap();
        let a2 = h.build_child(&a1.hash(), vec![], h.miner(), 60);
        h.chain.submit_block(a2.clone(), BlockSource::Mined).unwrap();

        // Branch from genesis needing a depth-2 revert.
        let genesis = ChainManager::genesis_block(h.chain.config()).hash();
        let b1 = h.build_child(&genesis, vec![], miner_b, 61);
        h.chain.submit_block(b1.clone(), BlockSource::Peer).unwrap();
        let b2 = h.build_child(&b1.hash(), vec![], miner_b, 60);
        h.chain.submit_block(b2.clone(), BlockSource::Peer).unwrap();
        let b3 = h.build_child(&b2.hash(), vec![], miner_b, 60);
        assert!(matches!(
            h.chain.submit_block(b3, BlockSource::Peer),
            Err(CoreError::ReorgTooDeep { depth: 2, limit: 1 })
        ));
        assert_eq!(h.chain.tip(), (a2.hash(), 2));
    }

    #[test]
    fn template_tracks_tip_and_sequence() {
        let h = Harness::new();
        let seq_before = h.chain.template_seq();
        let template = h.chain.template(h.miner()).unwrap();
        assert_eq!(template.seq, seq_before);
        assert_eq!(template.block.height(), 1);

        let block = h.mine_on_tip(vec![]);
        h.chain.submit_block(block.clone(), BlockSource::Mined).unwrap();
        assert!(h.chain.template_seq() > seq_before);

        let next = h.chain.template(h.miner()).unwrap();
        assert_eq!(next.block.header.prev_hash, block.hash());
        assert_eq!(next.block.height(), 2);
    }

    #[test]
    fn retarget_applies_at_window_boundary() {
        let h = Harness::new();
        let consensus = h.chain.config().consensus.clone();
        assert_eq!(consensus.retarget_window, 16);

        // Mine 15 blocks spaced at half the target time.
        for _ in 1..16 {
            let (tip, _) = h.chain.tip();
            let block = h.build_child(&tip, vec![], h.miner(), consensus.block_timing_seconds / 2);
            h.chain.submit_block(block, BlockSource::Mined).unwrap();
        }
        let (tip, height) = h.chain.tip();
        assert_eq!(height, 15);

        let actual = consensus.n_measurement * consensus.block_timing_seconds / 2;
        let expected = difficulty::retarget(
            h.params.genesis_bits,
            actual,
            &consensus,
            h.params.genesis_bits,
        )
        .unwrap();
        let bits = h.chain.next_difficulty_bits(&tip).unwrap();
        assert_eq!(bits, expected);
        assert_ne!(bits, h.params.genesis_bits);

        // And a block mined at the boundary carries the new bits.
        let block16 = h.mine_on_tip(vec![]);
        assert_eq!(block16.header.difficulty_bits, bits);
        h.chain.submit_block(block16, BlockSource::Mined).unwrap();
        assert_eq!(h.chain.tip().1, 16);
    }

    #[test]
    fn header_hashes_window() {
        let h = Harness::new();
        let mut hashes = vec![h.chain.tip().0];
        for _ in 0..3 {
            let block = h.mine_on_tip(vec![]);
            hashes.push(block.hash());
            h.chain.submit_block(block, BlockSource::Mined).unwrap();
        }
        assert_eq!(h.chain.header_hashes_from(0, 10).unwrap(), hashes);
        assert_eq!(h.chain.header_hashes_from(2, 2).unwrap(), hashes[2..4].to_vec());
    }

    #[test]
    fn interrupted_reorg_is_rolled_back_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = dev_config();
        let params = NetworkParams::for_network(config.network_type);

        let open_chain = || {
            let store = Arc::new(
                Store::open(dir.path(), params.magic, &StorageConfig::default()).unwrap(),
            );
            let mempool = Arc::new(Mempool::new(
                config.mempool.clone(),
                config.consensus.clone(),
                params.address_version,
            ));
            ChainManager::open(store, config.clone(), mempool).unwrap()
        };

        let tip_before;
        {
            let chain = open_chain();
            let genesis = chain.tip().0;
            let parent = chain.block_by_hash(&genesis).unwrap().unwrap();
            let miner = Address::from_seed(params.address_version, "m");
            let consensus = &config.consensus;
            let coinbase = Transaction::coinbase(miner, subsidy(1, consensus), 1);
            let mut block = Block {
                header: BlockHeader {
                    prev_hash: genesis,
                    block_number: 1,
                    timestamp: parent.header.timestamp + 60,
                    merkle_root: Block::merkle_root(std::slice::from_ref(&coinbase)),
                    difficulty_bits: params.genesis_bits,
                    mining_nonce: 0,
                    extra_nonce: 0,
                    block_reward: subsidy(1, consensus),
                    fee_reward: 0,
                },
                transactions: vec![coinbase],
            };
            while !difficulty::meets_target(&block.hash(), params.genesis_bits).unwrap() {
                block.header.mining_nonce += 1;
            }
            chain.submit_block(block, BlockSource::Mined).unwrap();
            tip_before = chain.tip();

            // Simulate a crash mid-reorg: persist a ForkState claiming the
            // tip block was being reorged away.
            let fork = ForkState {
                fork_point: genesis,
                old_path: vec![tip_before.0],
                new_path: vec![],
            };
            chain
                .store()
                .put(&keys::fork_state(), &fork.encode())
                .unwrap();
            chain.store().flush().unwrap();
        }

        // Reopen: recovery restores the old chain and clears the record.
        let chain = open_chain();
        assert_eq!(chain.tip(), tip_before);
        assert_eq!(chain.store().get(&keys::fork_state()).unwrap(), None);
    }
}
