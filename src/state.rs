//! Account/nonce chain state and the copy-on-write overlay that applies
//! blocks.
//!
//! Mutations never touch the store directly: a [`StateOverlay`] accumulates
//! them per block, recording the prior value of every touched key. On commit
//! the overlay flushes into the block's atomic batch together with that
//! write-set (`0x07‖block_hash`), and reverting a block is nothing but
//! restoring the recorded priors, which keeps reverts deterministic and
//! crash-safe.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::crypto::{self, Address, Hash32};
use crate::error::CoreError;
use crate::store::{keys, Store};
use crate::transaction::{
    sum_outputs, Output, SlaveKey, Transaction, TxHash, TxKind, SLAVE_ACCESS_FULL,
    SLAVE_ACCESS_MINT_ONLY,
};
use crate::wire::{Reader, WireDecode, WireEncode, Writer};
use crate::Result;

/// Per-address account record. Absent addresses read as the default-zero
/// account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    pub balance: u64,
    pub nonce: u64,
    pub token_balances: BTreeMap<Hash32, u64>,
    /// Hashes of signing keys this account has consumed. Consensus: a key
    /// signs at most once.
    pub used_signing_keys: BTreeSet<Hash32>,
    /// Delegated slave keys: key hash to access type.
    pub delegated_keys: BTreeMap<Hash32, u8>,
    /// Present when this address is a multi-sig account.
    pub multi_sig: Option<MultiSigMeta>,
}

impl AccountState {
    pub fn is_default(&self) -> bool {
        *self == AccountState::default()
    }

    pub fn token_balance(&self, token: &Hash32) -> u64 {
        self.token_balances.get(token).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiSigMeta {
    pub signatories: Vec<Address>,
    pub weights: Vec<u64>,
    pub threshold: u64,
    pub creation_tx: TxHash,
}

impl MultiSigMeta {
    pub fn weight_of(&self, addr: &Address) -> Option<u64> {
        self.signatories
            .iter()
            .position(|signatory| signatory == addr)
            .map(|i| self.weights[i])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMeta {
    pub symbol: Vec<u8>,
    pub name: Vec<u8>,
    pub owner: Address,
    pub decimals: u8,
    pub creation_tx: TxHash,
    pub total_supply: u64,
}

/// An open multi-sig spend proposal, keyed by its creating tx hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSpend {
    pub multi_sig_address: Address,
    pub initiator: Address,
    pub outputs: Vec<Output>,
    pub expiry_block_number: u64,
    pub votes: BTreeSet<Address>,
    pub executed: bool,
}

/// Prior values of every key a block touched, in touch order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

// -- wire codecs -------------------------------------------------------------

impl WireEncode for AccountState {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u64(self.balance);
        out.put_u64(self.nonce);
        out.put_u32(self.token_balances.len() as u32);
        for (token, amount) in &self.token_balances {
            out.put_hash(token);
            out.put_u64(*amount);
        }
        out.put_u32(self.used_signing_keys.len() as u32);
        for key in &self.used_signing_keys {
            out.put_hash(key);
        }
        out.put_u32(self.delegated_keys.len() as u32);
        for (key, access) in &self.delegated_keys {
            out.put_hash(key);
            out.put_u8(*access);
        }
        match &self.multi_sig {
            Some(meta) => {
                out.put_bool(true);
                meta.encode_into(out);
            }
            None => out.put_bool(false),
        }
    }
}

const MAX_STATE_ITEMS: usize = 1_000_000;

impl WireDecode for AccountState {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let balance = reader.u64()?;
        let nonce = reader.u64()?;
        let token_pairs = reader.vec(MAX_STATE_ITEMS, |r| Ok((r.hash()?, r.u64()?)))?;
        let used = reader.vec(MAX_STATE_ITEMS, |r| r.hash())?;
        let delegated = reader.vec(MAX_STATE_ITEMS, |r| Ok((r.hash()?, r.u8()?)))?;
        let multi_sig = if reader.bool()? {
            Some(MultiSigMeta::decode_from(reader)?)
        } else {
            None
        };
        Ok(AccountState {
            balance,
            nonce,
            token_balances: token_pairs.into_iter().collect(),
            used_signing_keys: used.into_iter().collect(),
            delegated_keys: delegated.into_iter().collect(),
            multi_sig,
        })
    }
}

impl WireEncode for MultiSigMeta {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u32(self.signatories.len() as u32);
        for addr in &self.signatories {
            out.put_address(addr);
        }
        out.put_u32(self.weights.len() as u32);
        for weight in &self.weights {
            out.put_u64(*weight);
        }
        out.put_u64(self.threshold);
        out.put_hash(&self.creation_tx);
    }
}

impl WireDecode for MultiSigMeta {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let signatories = reader.vec(crate::transaction::MAX_SIGNATORIES, |r| r.address())?;
        let weights = reader.vec(crate::transaction::MAX_SIGNATORIES, |r| r.u64())?;
        if signatories.len() != weights.len() {
            return Err(CoreError::Malformed("multi-sig arity mismatch".into()));
        }
        Ok(MultiSigMeta {
            signatories,
            weights,
            threshold: reader.u64()?,
            creation_tx: reader.hash()?,
        })
    }
}

impl WireEncode for TokenMeta {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_bytes(&self.symbol);
        out.put_bytes(&self.name);
        out.put_address(&self.owner);
        out.put_u8(self.decimals);
        out.put_hash(&self.creation_tx);
        out.put_u64(self.total_supply);
    }
}

impl WireDecode for TokenMeta {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(TokenMeta {
            symbol: reader.bytes(crate::transaction::MAX_TOKEN_SYMBOL_LEN)?,
            name: reader.bytes(crate::transaction::MAX_TOKEN_NAME_LEN)?,
            owner: reader.address()?,
            decimals: reader.u8()?,
            creation_tx: reader.hash()?,
            total_supply: reader.u64()?,
        })
    }
}

impl WireEncode for PendingSpend {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_address(&self.multi_sig_address);
        out.put_address(&self.initiator);
        out.put_u32(self.outputs.len() as u32);
        for output in &self.outputs {
            out.put_address(&output.recipient);
            out.put_u64(output.amount);
        }
        out.put_u64(self.expiry_block_number);
        out.put_u32(self.votes.len() as u32);
        for voter in &self.votes {
            out.put_address(voter);
        }
        out.put_bool(self.executed);
    }
}

impl WireDecode for PendingSpend {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let multi_sig_address = reader.address()?;
        let initiator = reader.address()?;
        let outputs = reader.vec(crate::transaction::MAX_OUTPUTS, |r| {
            Ok(Output {
                recipient: r.address()?,
                amount: r.u64()?,
            })
        })?;
        let expiry_block_number = reader.u64()?;
        let votes = reader.vec(crate::transaction::MAX_SIGNATORIES, |r| r.address())?;
        Ok(PendingSpend {
            multi_sig_address,
            initiator,
            outputs,
            expiry_block_number,
            votes: votes.into_iter().collect(),
            executed: reader.bool()?,
        })
    }
}

impl WireEncode for WriteSet {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u32(self.entries.len() as u32);
        for (key, prior) in &self.entries {
            out.put_bytes(key);
            match prior {
                Some(value) => {
                    out.put_bool(true);
                    out.put_bytes(value);
                }
                None => out.put_bool(false),
            }
        }
    }
}

impl WireDecode for WriteSet {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let entries = reader.vec(MAX_STATE_ITEMS, |r| {
            let key = r.bytes(1024)?;
            let prior = if r.bool()? {
                Some(r.bytes(crate::wire::MAX_FIELD_BYTES)?)
            } else {
                None
            };
            Ok((key, prior))
        })?;
        Ok(WriteSet { entries })
    }
}

// -- overlay -----------------------------------------------------------------

/// Context a block is applied under.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub height: u64,
    pub address_version: u8,
}

/// Copy-on-write view over the store for applying one block (or, in the
/// mempool, for dry-running candidate transactions). Nothing escapes until
/// [`StateOverlay::into_commit`].
pub struct StateOverlay<'a> {
    store: &'a Store,
    accounts: HashMap<Address, AccountState>,
    tokens: HashMap<Hash32, Option<TokenMeta>>,
    spends: HashMap<TxHash, Option<PendingSpend>>,
    /// Keys mutated by this overlay, in first-touch order, with their store
    /// priors.
    touched: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    touched_index: HashMap<Vec<u8>, usize>,
}

impl<'a> StateOverlay<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            accounts: HashMap::new(),
            tokens: HashMap::new(),
            spends: HashMap::new(),
            touched: Vec::new(),
            touched_index: HashMap::new(),
        }
    }

    pub fn account(&mut self, addr: &Address) -> Result<&AccountState> {
        self.load_account(addr)?;
        Ok(self.accounts.get(addr).expect("account just loaded"))
    }

    fn load_account(&mut self, addr: &Address) -> Result<()> {
        if !self.accounts.contains_key(addr) {
            let state = match self.store.get(&keys::account(addr))? {
                Some(bytes) => AccountState::decode(&bytes)?,
                None => AccountState::default(),
            };
            self.accounts.insert(*addr, state);
        }
        Ok(())
    }

    fn account_mut(&mut self, addr: &Address) -> Result<&mut AccountState> {
        self.load_account(addr)?;
        self.touch(keys::account(addr))?;
        Ok(self.accounts.get_mut(addr).expect("account just loaded"))
    }

    pub fn token(&mut self, token: &Hash32) -> Result<Option<&TokenMeta>> {
        if !self.tokens.contains_key(token) {
            let meta = match self.store.get(&keys::token(token))? {
                Some(bytes) => Some(TokenMeta::decode(&bytes)?),
                None => None,
            };
            self.tokens.insert(*token, meta);
        }
        Ok(self.tokens.get(token).expect("token just loaded").as_ref())
    }

    fn put_token(&mut self, token: Hash32, meta: TokenMeta) -> Result<()> {
        self.touch(keys::token(&token))?;
        self.tokens.insert(token, Some(meta));
        Ok(())
    }

    pub fn pending_spend(&mut self, spend_tx: &TxHash) -> Result<Option<&PendingSpend>> {
        if !self.spends.contains_key(spend_tx) {
            let spend = match self.store.get(&keys::pending_spend(spend_tx))? {
                Some(bytes) => Some(PendingSpend::decode(&bytes)?),
                None => None,
            };
            self.spends.insert(*spend_tx, spend);
        }
        Ok(self.spends.get(spend_tx).expect("spend just loaded").as_ref())
    }

    fn spend_mut(&mut self, spend_tx: &TxHash) -> Result<&mut PendingSpend> {
        self.pending_spend(spend_tx)?;
        self.touch(keys::pending_spend(spend_tx))?;
        self.spends
            .get_mut(spend_tx)
            .and_then(|spend| spend.as_mut())
            .ok_or_else(|| CoreError::InvalidTransaction("unknown multi-sig spend".into()))
    }

    fn put_spend(&mut self, spend_tx: TxHash, spend: PendingSpend) -> Result<()> {
        self.touch(keys::pending_spend(&spend_tx))?;
        self.spends.insert(spend_tx, Some(spend));
        Ok(())
    }

    /// Record a key's store prior the first time it is mutated.
    fn touch(&mut self, key: Vec<u8>) -> Result<()> {
        if !self.touched_index.contains_key(&key) {
            let prior = self.store.get(&key)?;
            self.touched_index.insert(key.clone(), self.touched.len());
            self.touched.push((key, prior));
        }
        Ok(())
    }

    /// Resolve which account the declared public key may act for, and with
    /// what access. Returns the signer's key hash.
    fn authorize_signer(&mut self, tx: &Transaction, ctx: &BlockContext) -> Result<Hash32> {
        let key_hash = crypto::hash256(&tx.public_key);
        let direct = Address::from_public_key(ctx.address_version, &tx.public_key);
        if direct == tx.master_addr {
            return Ok(key_hash);
        }
        let master = self.account(&tx.master_addr)?;
        match master.delegated_keys.get(&key_hash) {
            Some(&access) => {
                let allowed = match access {
                    SLAVE_ACCESS_FULL => true,
                    // Mint-only keys may issue tokens and nothing else; in
                    // particular they can never move the master's funds.
                    SLAVE_ACCESS_MINT_ONLY => matches!(tx.kind, TxKind::TokenCreate { .. }),
                    _ => false,
                };
                if !allowed {
                    return Err(CoreError::InvalidTransaction(
                        "slave key lacks access for this transaction type".into(),
                    ));
                }
                Ok(key_hash)
            }
            None => Err(CoreError::InvalidTransaction(
                "public key does not control the master address".into(),
            )),
        }
    }

    /// Stateful validation and application of one non-coinbase transaction.
    /// All-or-nothing: any error leaves the overlay dirty and the caller
    /// drops it.
    pub fn apply_transaction(&mut self, tx: &Transaction, ctx: &BlockContext) -> Result<()> {
        if tx.is_coinbase() {
            return Err(CoreError::InvalidTransaction(
                "coinbase cannot be applied as a standalone transaction".into(),
            ));
        }

        let key_hash = self.authorize_signer(tx, ctx)?;
        if !tx.verify_signature() {
            return Err(CoreError::InvalidSignature);
        }

        let debit = tx.required_balance()?;
        {
            let account = self.account(&tx.master_addr)?;
            if account.used_signing_keys.contains(&key_hash) {
                return Err(CoreError::ReusedSigningKey);
            }
            let expected = account.nonce + 1;
            if tx.nonce != expected {
                return Err(CoreError::NonceGap {
                    expected,
                    got: tx.nonce,
                });
            }
            if account.balance < debit {
                return Err(CoreError::InsufficientBalance {
                    needed: debit,
                    available: account.balance,
                });
            }
        }

        // Variant-specific checks that must precede any mutation.
        self.check_kind(tx, ctx)?;

        // Envelope effects.
        {
            let account = self.account_mut(&tx.master_addr)?;
            account.balance -= debit;
            account.nonce += 1;
            account.used_signing_keys.insert(key_hash);
        }

        // Payload effects.
        self.apply_kind(tx, ctx)
    }

    fn check_kind(&mut self, tx: &Transaction, ctx: &BlockContext) -> Result<()> {
        match &tx.kind {
            TxKind::Transfer { .. } | TxKind::Message { .. } => Ok(()),
            TxKind::Coinbase { .. } => unreachable!("filtered above"),
            TxKind::TokenCreate { .. } => {
                let token = tx.hash();
                if self.token(&token)?.is_some() {
                    return Err(CoreError::InvalidTransaction("token already exists".into()));
                }
                Ok(())
            }
            TxKind::TokenTransfer { token, outputs } => {
                if self.token(token)?.is_none() {
                    return Err(CoreError::UnknownToken);
                }
                let needed = sum_outputs(outputs)?;
                let available = self.account(&tx.master_addr)?.token_balance(token);
                if available < needed {
                    return Err(CoreError::InsufficientBalance { needed, available });
                }
                Ok(())
            }
            TxKind::Slave { keys: slave_keys } => {
                let account = self.account(&tx.master_addr)?;
                let mut fresh = BTreeSet::new();
                for SlaveKey { public_key, .. } in slave_keys {
                    let key_hash = crypto::hash256(public_key);
                    if account.delegated_keys.contains_key(&key_hash) || !fresh.insert(key_hash) {
                        return Err(CoreError::InvalidTransaction(
                            "slave key already registered".into(),
                        ));
                    }
                }
                Ok(())
            }
            TxKind::MultiSigCreate { .. } => {
                let addr = Address::from_multisig(ctx.address_version, &tx.hash());
                if !self.account(&addr)?.is_default() {
                    return Err(CoreError::InvalidTransaction(
                        "multi-sig address already exists".into(),
                    ));
                }
                Ok(())
            }
            TxKind::MultiSigSpend {
                multi_sig_address,
                expiry_block_number,
                ..
            } => {
                if *expiry_block_number < ctx.height {
                    return Err(CoreError::Expired {
                        expiry: *expiry_block_number,
                        tip: ctx.height,
                    });
                }
                let target = self.account(multi_sig_address)?.clone();
                let meta = target.multi_sig.as_ref().ok_or_else(|| {
                    CoreError::InvalidTransaction("target is not a multi-sig account".into())
                })?;
                if meta.weight_of(&tx.master_addr).is_none() {
                    return Err(CoreError::InvalidTransaction(
                        "spend proposer is not a signatory".into(),
                    ));
                }
                Ok(())
            }
            TxKind::MultiSigVote { spend_tx, unvote } => {
                let spend = self
                    .pending_spend(spend_tx)?
                    .cloned()
                    .ok_or_else(|| CoreError::InvalidTransaction("unknown multi-sig spend".into()))?;
                if spend.executed {
                    return Err(CoreError::InvalidTransaction(
                        "multi-sig spend already executed".into(),
                    ));
                }
                if spend.expiry_block_number < ctx.height {
                    return Err(CoreError::Expired {
                        expiry: spend.expiry_block_number,
                        tip: ctx.height,
                    });
                }
                let target = self.account(&spend.multi_sig_address)?.clone();
                let meta = target.multi_sig.as_ref().ok_or_else(|| {
                    CoreError::InvalidTransaction("spend target lost multi-sig meta".into())
                })?;
                if meta.weight_of(&tx.master_addr).is_none() {
                    return Err(CoreError::InvalidTransaction("voter is not a signatory".into()));
                }
                if *unvote && !spend.votes.contains(&tx.master_addr) {
                    return Err(CoreError::InvalidTransaction("no vote to withdraw".into()));
                }
                Ok(())
            }
        }
    }

    fn apply_kind(&mut self, tx: &Transaction, ctx: &BlockContext) -> Result<()> {
        match &tx.kind {
            TxKind::Transfer { outputs, .. } => {
                for output in outputs {
                    let recipient = self.account_mut(&output.recipient)?;
                    recipient.balance = recipient
                        .balance
                        .checked_add(output.amount)
                        .ok_or_else(|| CoreError::InvalidTransaction("balance overflow".into()))?;
                }
                Ok(())
            }
            TxKind::Coinbase { .. } => unreachable!("filtered above"),
            TxKind::Message { .. } => Ok(()),
            TxKind::TokenCreate {
                symbol,
                name,
                owner,
                decimals,
                initial_balances,
            } => {
                let token = tx.hash();
                let total_supply = sum_outputs(initial_balances)?;
                self.put_token(
                    token,
                    TokenMeta {
                        symbol: symbol.clone(),
                        name: name.clone(),
                        owner: *owner,
                        decimals: *decimals,
                        creation_tx: token,
                        total_supply,
                    },
                )?;
                for output in initial_balances {
                    let holder = self.account_mut(&output.recipient)?;
                    let entry = holder.token_balances.entry(token).or_insert(0);
                    *entry = entry
                        .checked_add(output.amount)
                        .ok_or_else(|| CoreError::InvalidTransaction("token overflow".into()))?;
                }
                Ok(())
            }
            TxKind::TokenTransfer { token, outputs } => {
                let moved = sum_outputs(outputs)?;
                {
                    let sender = self.account_mut(&tx.master_addr)?;
                    let balance = sender.token_balances.entry(*token).or_insert(0);
                    *balance -= moved;
                    if *balance == 0 {
                        sender.token_balances.remove(token);
                    }
                }
                for output in outputs {
                    let recipient = self.account_mut(&output.recipient)?;
                    let entry = recipient.token_balances.entry(*token).or_insert(0);
                    *entry = entry
                        .checked_add(output.amount)
                        .ok_or_else(|| CoreError::InvalidTransaction("token overflow".into()))?;
                }
                Ok(())
            }
            TxKind::Slave { keys: slave_keys } => {
                let account = self.account_mut(&tx.master_addr)?;
                for SlaveKey {
                    public_key,
                    access_type,
                } in slave_keys
                {
                    account
                        .delegated_keys
                        .insert(crypto::hash256(public_key), *access_type);
                }
                Ok(())
            }
            TxKind::MultiSigCreate {
                signatories,
                weights,
                threshold,
            } => {
                let creation_tx = tx.hash();
                let addr = Address::from_multisig(ctx.address_version, &creation_tx);
                let account = self.account_mut(&addr)?;
                account.multi_sig = Some(MultiSigMeta {
                    signatories: signatories.clone(),
                    weights: weights.clone(),
                    threshold: *threshold,
                    creation_tx,
                });
                Ok(())
            }
            TxKind::MultiSigSpend {
                multi_sig_address,
                outputs,
                expiry_block_number,
            } => {
                self.put_spend(
                    tx.hash(),
                    PendingSpend {
                        multi_sig_address: *multi_sig_address,
                        initiator: tx.master_addr,
                        outputs: outputs.clone(),
                        expiry_block_number: *expiry_block_number,
                        votes: BTreeSet::new(),
                        executed: false,
                    },
                )?;
                Ok(())
            }
            TxKind::MultiSigVote { spend_tx, unvote } => {
                {
                    let spend = self.spend_mut(spend_tx)?;
                    if *unvote {
                        spend.votes.remove(&tx.master_addr);
                    } else {
                        spend.votes.insert(tx.master_addr);
                    }
                }
                self.try_execute_spend(spend_tx)
            }
        }
    }

    /// Execute a pending spend once its accumulated weight reaches the
    /// threshold. Insufficient multi-sig balance leaves the spend pending;
    /// the votes stand and a later top-up plus vote can still execute it
    /// before expiry.
    fn try_execute_spend(&mut self, spend_tx: &TxHash) -> Result<()> {
        let spend = self.spend_mut(spend_tx)?.clone();
        let target = self.account(&spend.multi_sig_address)?.clone();
        let meta = target.multi_sig.as_ref().ok_or_else(|| {
            CoreError::InvalidTransaction("spend target lost multi-sig meta".into())
        })?;

        let weight: u64 = spend
            .votes
            .iter()
            .filter_map(|voter| meta.weight_of(voter))
            .sum();
        if weight < meta.threshold {
            return Ok(());
        }

        let total = sum_outputs(&spend.outputs)?;
        if target.balance < total {
            log::debug!(
                "multi-sig spend {} reached threshold but balance {} < {total}, leaving pending",
                hex::encode(spend_tx),
                target.balance
            );
            return Ok(());
        }

        {
            let account = self.account_mut(&spend.multi_sig_address)?;
            account.balance -= total;
        }
        for output in &spend.outputs {
            let recipient = self.account_mut(&output.recipient)?;
            recipient.balance = recipient
                .balance
                .checked_add(output.amount)
                .ok_or_else(|| CoreError::InvalidTransaction("balance overflow".into()))?;
        }
        self.spend_mut(spend_tx)?.executed = true;
        Ok(())
    }

    /// Credit the coinbase payout. Validity of the amount against subsidy
    /// and fees is the block-structure check's job.
    pub fn apply_coinbase(&mut self, tx: &Transaction) -> Result<()> {
        let TxKind::Coinbase { recipient, amount } = &tx.kind else {
            return Err(CoreError::InvalidBlock("transaction 0 is not a coinbase".into()));
        };
        let account = self.account_mut(recipient)?;
        account.balance = account
            .balance
            .checked_add(*amount)
            .ok_or_else(|| CoreError::InvalidBlock("coinbase balance overflow".into()))?;
        Ok(())
    }

    /// Apply a whole block: coinbase first, then the remaining transactions
    /// in declared order. Any failure poisons the overlay.
    pub fn apply_block(&mut self, block: &crate::block::Block, ctx: &BlockContext) -> Result<()> {
        self.apply_coinbase(&block.transactions[0])?;
        for tx in &block.transactions[1..] {
            self.apply_transaction(tx, ctx)?;
        }
        Ok(())
    }

    /// Flush the overlay into `batch` and return the write-set that inverts
    /// it. The caller stores the write-set under `0x07‖block_hash` inside
    /// the same batch.
    pub fn into_commit(self, batch: &mut sled::Batch) -> WriteSet {
        for (key, _) in &self.touched {
            match key.first() {
                Some(&keys::ACCOUNT) => {
                    let mut raw = [0u8; crate::crypto::ADDRESS_SIZE];
                    raw.copy_from_slice(&key[1..]);
                    let addr = Address::from_raw(raw);
                    let account = self.accounts.get(&addr).expect("touched account loaded");
                    if account.is_default() {
                        batch.remove(key.clone());
                    } else {
                        batch.insert(key.clone(), account.encode());
                    }
                }
                Some(&keys::TOKEN) => {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&key[1..]);
                    match self.tokens.get(&hash).and_then(|t| t.as_ref()) {
                        Some(meta) => batch.insert(key.clone(), meta.encode()),
                        None => batch.remove(key.clone()),
                    }
                }
                Some(&keys::PENDING_SPEND) => {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&key[1..]);
                    match self.spends.get(&hash).and_then(|s| s.as_ref()) {
                        Some(spend) => batch.insert(key.clone(), spend.encode()),
                        None => batch.remove(key.clone()),
                    }
                }
                _ => unreachable!("overlay only touches state keys"),
            }
        }
        WriteSet {
            entries: self.touched,
        }
    }
}

/// Build the batch that undoes a committed block by restoring the priors
/// recorded in its write-set.
pub fn revert_batch(write_set: &WriteSet) -> sled::Batch {
    let mut batch = sled::Batch::default();
    for (key, prior) in &write_set.entries {
        match prior {
            Some(value) => batch.insert(key.clone(), value.clone()),
            None => batch.remove(key.clone()),
        }
    }
    batch
}
