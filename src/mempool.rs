use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{ConsensusConfig, MempoolConfig};
use crate::crypto::Address;
use crate::error::CoreError;
use crate::state::{BlockContext, StateOverlay};
use crate::store::{keys, Store};
use crate::transaction::{Transaction, TxHash};
use crate::Result;

/// Pool entry with the metadata admission computed.
#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: Transaction,
    size: usize,
    fee_rate: u64,
    added_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolStats {
    pub transactions: usize,
    pub bytes: usize,
    pub signers: usize,
}

struct Inner {
    entries: HashMap<TxHash, MempoolEntry>,
    /// Fee-rate index; first entry is the cheapest transaction.
    by_rate: BTreeMap<(u64, TxHash), ()>,
    by_signer: HashMap<Address, HashSet<TxHash>>,
    bytes: usize,
}

impl Inner {
    fn remove(&mut self, hash: &TxHash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(hash)?;
        self.by_rate.remove(&(entry.fee_rate, *hash));
        if let Some(set) = self.by_signer.get_mut(&entry.tx.master_addr) {
            set.remove(hash);
            if set.is_empty() {
                self.by_signer.remove(&entry.tx.master_addr);
            }
        }
        self.bytes -= entry.size;
        Some(entry)
    }

    fn insert(&mut self, hash: TxHash, entry: MempoolEntry) {
        self.by_rate.insert((entry.fee_rate, hash), ());
        self.by_signer
            .entry(entry.tx.master_addr)
            .or_default()
            .insert(hash);
        self.bytes += entry.size;
        self.entries.insert(hash, entry);
    }

    /// Pending transactions of one signer in nonce order.
    fn signer_chain(&self, signer: &Address) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self
            .by_signer
            .get(signer)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|hash| self.entries.get(hash))
                    .map(|entry| entry.tx.clone())
                    .collect()
            })
            .unwrap_or_default();
        txs.sort_by_key(|tx| tx.nonce);
        txs
    }
}

/// Pending-transaction pool. Admission dry-runs candidates against a
/// copy-on-write overlay of the chain tip; the real state is never touched.
pub struct Mempool {
    config: MempoolConfig,
    consensus: ConsensusConfig,
    address_version: u8,
    inner: RwLock<Inner>,
}

impl Mempool {
    pub fn new(config: MempoolConfig, consensus: ConsensusConfig, address_version: u8) -> Self {
        Self {
            config,
            consensus,
            address_version,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                by_rate: BTreeMap::new(),
                by_signer: HashMap::new(),
                bytes: 0,
            }),
        }
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.inner.read().entries.contains_key(hash)
    }

    pub fn get(&self, hash: &TxHash) -> Option<Transaction> {
        self.inner.read().entries.get(hash).map(|entry| entry.tx.clone())
    }

    pub fn stats(&self) -> MempoolStats {
        let inner = self.inner.read();
        MempoolStats {
            transactions: inner.entries.len(),
            bytes: inner.bytes,
            signers: inner.by_signer.len(),
        }
    }

    /// Admission pipeline: stateless checks, fee floor, stateful dry-run on
    /// top of the signer's already-pending chain, then byte-budget eviction.
    /// Returns the tx hash to announce on success.
    pub fn admit(&self, tx: Transaction, store: &Store, tip_height: u64) -> Result<TxHash> {
        if tx.is_coinbase() {
            return Err(CoreError::InvalidTransaction(
                "coinbase transactions are never relayed".into(),
            ));
        }
        tx.basic_validate(&self.consensus)?;

        let hash = tx.hash();
        if self.contains(&hash) {
            return Err(CoreError::DuplicateTx);
        }

        let size = tx.size_bytes();
        let fee_rate = tx.fee_rate();
        if fee_rate < self.config.min_fee_per_byte {
            return Err(CoreError::FeeTooLow {
                minimum: self.config.min_fee_per_byte,
                got: fee_rate,
            });
        }

        // Stateful dry-run: replay the signer's pending chain, then the
        // candidate, against a throwaway overlay of the tip.
        let ctx = BlockContext {
            height: tip_height + 1,
            address_version: self.address_version,
        };
        {
            let inner = self.inner.read();
            let mut overlay = StateOverlay::new(store);
            for pending in inner.signer_chain(&tx.master_addr) {
                overlay.apply_transaction(&pending, &ctx)?;
            }
            overlay.apply_transaction(&tx, &ctx)?;
        }

        let mut inner = self.inner.write();
        if inner.entries.contains_key(&hash) {
            return Err(CoreError::DuplicateTx);
        }

        // Evict cheapest entries until the candidate fits. A candidate that
        // cannot displace cheaper mass is refused; evicted transactions are
        // simply dropped, not flagged invalid.
        while inner.bytes + size > self.config.mempool_max_bytes {
            let Some((lowest_rate, lowest_hash)) = inner.by_rate.keys().next().copied() else {
                return Err(CoreError::MempoolFull);
            };
            if lowest_rate >= fee_rate {
                return Err(CoreError::FeeTooLow {
                    minimum: lowest_rate + 1,
                    got: fee_rate,
                });
            }
            inner.remove(&lowest_hash);
            log::debug!("evicted {} at {lowest_rate} q/B for a richer transaction", hex::encode(lowest_hash));
        }

        inner.insert(
            hash,
            MempoolEntry {
                tx,
                size,
                fee_rate,
                added_at: Instant::now(),
            },
        );
        log::info!("mempool admitted {} at {fee_rate} q/B", hex::encode(hash));
        Ok(hash)
    }

    /// Select transactions for a block template: fee-rate descending, with
    /// each signer's transactions emitted in nonce order.
    pub fn take_for_block(&self, max_bytes: usize, max_count: usize) -> Vec<Transaction> {
        let inner = self.inner.read();

        let mut picked: Vec<&MempoolEntry> = Vec::new();
        let mut total = 0usize;
        for &(_, hash) in inner.by_rate.keys().rev() {
            if picked.len() >= max_count {
                break;
            }
            let entry = &inner.entries[&hash];
            if total + entry.size > max_bytes {
                continue;
            }
            total += entry.size;
            picked.push(entry);
        }

        // Rewrite each signer's slots with its lowest pending nonces so the
        // block order satisfies the nonce chain.
        let mut queues: HashMap<Address, std::collections::VecDeque<Transaction>> = HashMap::new();
        for entry in &picked {
            queues.entry(entry.tx.master_addr).or_default();
        }
        for (signer, queue) in queues.iter_mut() {
            let count = picked
                .iter()
                .filter(|entry| entry.tx.master_addr == *signer)
                .count();
            queue.extend(inner.signer_chain(signer).into_iter().take(count));
        }
        picked
            .iter()
            .filter_map(|entry| queues.get_mut(&entry.tx.master_addr)?.pop_front())
            .collect()
    }

    /// Drop the transactions a new block confirmed, then re-validate what
    /// remains against the new tip.
    pub fn on_block_connected(&self, block: &crate::block::Block, store: &Store, tip_height: u64) {
        {
            let mut inner = self.inner.write();
            for tx in &block.transactions {
                inner.remove(&tx.hash());
            }
        }
        self.revalidate(store, tip_height);
    }

    /// After a reorg: try to restore transactions from disconnected blocks,
    /// then re-validate the whole pool against the new tip.
    pub fn on_reorg(&self, returned: Vec<Transaction>, store: &Store, tip_height: u64) {
        for tx in returned {
            if tx.is_coinbase() {
                continue;
            }
            if let Err(err) = self.admit(tx, store, tip_height) {
                log::debug!("disconnected transaction not re-admitted: {err}");
            }
        }
        self.revalidate(store, tip_height);
    }

    /// Re-run every signer's pending chain against the current tip and drop
    /// entries that no longer apply (consumed signing keys, passed nonces,
    /// spent balances, expired spends).
    fn revalidate(&self, store: &Store, tip_height: u64) {
        let ctx = BlockContext {
            height: tip_height + 1,
            address_version: self.address_version,
        };
        let signers: Vec<Address> = self.inner.read().by_signer.keys().copied().collect();
        let mut doomed: Vec<TxHash> = Vec::new();
        {
            let inner = self.inner.read();
            for signer in signers {
                let mut overlay = StateOverlay::new(store);
                let mut broken = false;
                for tx in inner.signer_chain(&signer) {
                    if broken || overlay.apply_transaction(&tx, &ctx).is_err() {
                        broken = true;
                        doomed.push(tx.hash());
                    }
                }
            }
        }
        if !doomed.is_empty() {
            let mut inner = self.inner.write();
            for hash in &doomed {
                inner.remove(hash);
            }
            log::info!("mempool dropped {} stale transactions", doomed.len());
        }
    }

    /// Expire entries older than the configured lifetime.
    pub fn expire_old(&self) {
        let max_age = Duration::from_secs(self.config.tx_expiry_secs);
        let mut inner = self.inner.write();
        let expired: Vec<TxHash> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.added_at.elapsed() > max_age)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            inner.remove(hash);
        }
        if !expired.is_empty() {
            log::info!("expired {} mempool transactions", expired.len());
        }
    }

    /// Persist the pool as a best-effort sidecar snapshot.
    pub fn persist_snapshot(&self, store: &Store) -> Result<()> {
        let txs: Vec<Transaction> = {
            let inner = self.inner.read();
            inner.entries.values().map(|entry| entry.tx.clone()).collect()
        };
        let bytes = bincode::serialize(&txs)?;
        store.put(&keys::mempool_snapshot(), &bytes)?;
        store.flush()
    }

    /// Reload a persisted snapshot, re-admitting whatever still validates.
    pub fn load_snapshot(&self, store: &Store, tip_height: u64) -> Result<usize> {
        let Some(bytes) = store.get(&keys::mempool_snapshot())? else {
            return Ok(0);
        };
        let txs: Vec<Transaction> = bincode::deserialize(&bytes)?;
        let mut restored = 0;
        for tx in txs {
            if self.admit(tx, store, tip_height).is_ok() {
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkParams, NetworkType, StorageConfig};
    use crate::crypto::FalconKeypair;
    use crate::state::AccountState;
    use crate::transaction::{Output, TxKind};
    use crate::wire::WireEncode;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Store,
        params: &'static NetworkParams,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let params = NetworkParams::for_network(NetworkType::Dev);
            let store = Store::open(dir.path(), params.magic, &StorageConfig::default()).unwrap();
            Self {
                _dir: dir,
                store,
                params,
            }
        }

        fn fund(&self, addr: &Address, balance: u64) {
            let account = AccountState {
                balance,
                ..Default::default()
            };
            self.store.put(&keys::account(addr), &account.encode()).unwrap();
        }

        fn pool(&self) -> Mempool {
            Mempool::new(
                MempoolConfig::default(),
                ConsensusConfig::default(),
                self.params.address_version,
            )
        }

        fn pool_with(&self, config: MempoolConfig) -> Mempool {
            Mempool::new(config, ConsensusConfig::default(), self.params.address_version)
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
    fn admits_and_dedupes() {
        let h = Harness::new();
        let pool = h.pool();
        let alice = FalconKeypair::generate();
        h.fund(&alice.address(h.params), 100_000);
        let bob = Address::from_seed(h.params.address_version, "bob");

        let tx = transfer(&alice, h.params, bob, 10, 2_000, 1);
        let hash = pool.admit(tx.clone(), &h.store, 10).unwrap();
        assert_eq!(hash, tx.hash());
        assert!(pool.contains(&hash));
        assert_eq!(pool.admit(tx, &h.store, 10), Err(CoreError::DuplicateTx));
    }

    #[test]
    fn rejects_below_fee_floor_and_bad_state() {
        let h = Harness::new();
        let pool = h.pool();
        let alice = FalconKeypair::generate();
        h.fund(&alice.address(h.params), 100_000);
        let bob = Address::from_seed(h.params.address_version, "bob");

        let cheap = transfer(&alice, h.params, bob, 10, 0, 1);
        assert!(matches!(
            pool.admit(cheap, &h.store, 10),
            Err(CoreError::FeeTooLow { .. })
        ));

        let broke = FalconKeypair::generate();
        let unfunded = transfer(&broke, h.params, bob, 10, 2_000, 1);
        assert!(matches!(
            pool.admit(unfunded, &h.store, 10),
            Err(CoreError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn pending_chain_validates_nonces() {
        let h = Harness::new();
        let pool = h.pool();
        let alice = FalconKeypair::generate();
        let alice_addr = alice.address(h.params);
        h.fund(&alice_addr, 1_000_000);
        let bob = Address::from_seed(h.params.address_version, "bob");

        // Nonce 1 spends with a key; nonce 2 must come from a registered
        // slave key, which pending tx 1 sets up.
        let k2 = FalconKeypair::generate();
        let mut first = Transaction::new(
            alice_addr,
            2_000,
            1,
            TxKind::Slave {
                keys: vec![crate::transaction::SlaveKey {
                    public_key: k2.public_key().to_vec(),
                    access_type: crate::transaction::SLAVE_ACCESS_FULL,
                }],
            },
        );
        first.sign(&alice).unwrap();
        pool.admit(first, &h.store, 10).unwrap();

        let mut second = transfer(&alice, h.params, bob, 10, 2_000, 2);
        second.sign(&k2).unwrap();
        pool.admit(second, &h.store, 10).unwrap();

        // A nonce gap is refused even though everything else is fine.
        let k3 = FalconKeypair::generate();
        let mut gapped = transfer(&alice, h.params, bob, 10, 2_000, 9);
        // k3 is unknown to the chain: register it through the pending chain
        // first would be nonce 3; nonce 9 is a gap either way.
        gapped.sign(&k3).ok();
        assert!(pool.admit(gapped, &h.store, 10).is_err());
        assert_eq!(pool.stats().transactions, 2);
    }

    #[test]
    fn byte_budget_evicts_cheapest_first() {
        let h = Harness::new();
        let mut config = MempoolConfig::default();
        config.mempool_max_bytes = 4_000; // roughly two signed transfers
        let pool = h.pool_with(config);

        let bob = Address::from_seed(h.params.address_version, "bob");
        let cheap1 = FalconKeypair::generate();
        let cheap2 = FalconKeypair::generate();
        let rich = FalconKeypair::generate();
        for kp in [&cheap1, &cheap2, &rich] {
            h.fund(&kp.address(h.params), 100_000_000);
        }

        let low1 = transfer(&cheap1, h.params, bob, 10, 2_000, 1);
        let low1_hash = pool.admit(low1, &h.store, 10).unwrap();
        let low2 = transfer(&cheap2, h.params, bob, 10, 6_000, 1);
        let low2_hash = pool.admit(low2, &h.store, 10).unwrap();

        // Ten times the fee rate: evicts the cheapest entry to fit.
        let high = transfer(&rich, h.params, bob, 10, 40_000, 1);
        let high_hash = pool.admit(high, &h.store, 10).unwrap();

        assert!(pool.contains(&high_hash));
        assert!(!pool.contains(&low1_hash));
        assert!(pool.contains(&low2_hash));

        // A new cheap transaction cannot displace richer mass.
        let cheap3 = FalconKeypair::generate();
        h.fund(&cheap3.address(h.params), 100_000_000);
        let low3 = transfer(&cheap3, h.params, bob, 10, 1_900, 1);
        assert!(matches!(
            pool.admit(low3, &h.store, 10),
            Err(CoreError::FeeTooLow { .. }) | Err(CoreError::MempoolFull)
        ));
    }

    #[test]
    fn selection_orders_nonces_within_signer() {
        let h = Harness::new();
        let pool = h.pool();
        let alice = FalconKeypair::generate();
        let alice_addr = alice.address(h.params);
        h.fund(&alice_addr, 1_000_000);
        let bob = Address::from_seed(h.params.address_version, "bob");

        let k2 = FalconKeypair::generate();
        // First pending tx registers the follow-up key, with a LOWER fee
        // than the second; selection must still order nonce 1 first.
        let mut first = Transaction::new(
            alice_addr,
            1_000,
            1,
            TxKind::Slave {
                keys: vec![crate::transaction::SlaveKey {
                    public_key: k2.public_key().to_vec(),
                    access_type: crate::transaction::SLAVE_ACCESS_FULL,
                }],
            },
        );
        first.sign(&alice).unwrap();
        pool.admit(first, &h.store, 10).unwrap();

        let mut second = transfer(&alice, h.params, bob, 10, 50_000, 2);
        second.sign(&k2).unwrap();
        pool.admit(second, &h.store, 10).unwrap();

        let selected = pool.take_for_block(1_000_000, 100);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].nonce, 1);
        assert_eq!(selected[1].nonce, 2);
    }

    #[test]
    fn block_connect_drops_confirmed_and_stale() {
        let h = Harness::new();
        let pool = h.pool();
        let alice = FalconKeypair::generate();
        let alice_addr = alice.address(h.params);
        h.fund(&alice_addr, 1_000_000);
        let bob = Address::from_seed(h.params.address_version, "bob");

        let tx = transfer(&alice, h.params, bob, 10, 2_000, 1);
        let hash = pool.admit(tx.clone(), &h.store, 10).unwrap();

        // Simulate the transaction confirming: the account state advances
        // (nonce bumped, key burned)...
        let mut account = AccountState {
            balance: 1_000_000 - 10 - 2_000,
            nonce: 1,
            ..Default::default()
        };
        account
            .used_signing_keys
            .insert(crate::crypto::hash256(alice.public_key()));
        h.store
            .put(&keys::account(&alice_addr), &account.encode())
            .unwrap();

        // ...and the block carrying it lands.
        let miner = Address::from_seed(h.params.address_version, "miner");
        let coinbase = Transaction::coinbase(miner, 1_000, 11);
        let block = crate::block::Block {
            header: crate::block::BlockHeader {
                prev_hash: [0u8; 32],
                block_number: 11,
                timestamp: 0,
                merkle_root: [0u8; 32],
                difficulty_bits: 0x207fffff,
                mining_nonce: 0,
                extra_nonce: 0,
                block_reward: 1_000,
                fee_reward: 2_000,
            },
            transactions: vec![coinbase, tx],
        };
        pool.on_block_connected(&block, &h.store, 11);
        assert!(!pool.contains(&hash));
        assert_eq!(pool.stats().transactions, 0);
    }

    #[test]
    fn snapshot_round_trip() {
        let h = Harness::new();
        let pool = h.pool();
        let alice = FalconKeypair::generate();
        h.fund(&alice.address(h.params), 1_000_000);
        let bob = Address::from_seed(h.params.address_version, "bob");

        let tx = transfer(&alice, h.params, bob, 10, 2_000, 1);
        let hash = pool.admit(tx, &h.store, 10).unwrap();
        pool.persist_snapshot(&h.store).unwrap();

        let fresh = h.pool();
        let restored = fresh.load_snapshot(&h.store, 10).unwrap();
        assert_eq!(restored, 1);
        assert!(fresh.contains(&hash));
    }
}
