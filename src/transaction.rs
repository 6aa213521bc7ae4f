use serde::{Deserialize, Serialize};

use crate::config::ConsensusConfig;
use crate::crypto::{self, Address, FalconKeypair, Hash32, FALCON_PUBKEY_SIZE, FALCON_SIG_MAX_SIZE};
use crate::error::CoreError;
use crate::wire::{Reader, WireDecode, WireEncode, Writer};
use crate::Result;

pub type TxHash = Hash32;

/// Full access: the slave key may sign any transaction type for the master.
pub const SLAVE_ACCESS_FULL: u8 = 0;
/// Restricted access: token minting (`TokenCreate`) only. A mint-only key
/// can never move the master's funds.
pub const SLAVE_ACCESS_MINT_ONLY: u8 = 1;

pub const MAX_OUTPUTS: usize = 100;
pub const MAX_SLAVE_KEYS: usize = 100;
pub const MAX_SIGNATORIES: usize = 100;
pub const MAX_TOKEN_SYMBOL_LEN: usize = 10;
pub const MAX_TOKEN_NAME_LEN: usize = 30;
pub const MAX_TOKEN_DECIMALS: u8 = 19;

/// A coin or token payout: recipient and amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub recipient: Address,
    pub amount: u64,
}

/// A delegated signing key with its access level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveKey {
    pub public_key: Vec<u8>,
    pub access_type: u8,
}

/// Transaction payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Ordered coin payouts with an optional opaque note.
    Transfer { outputs: Vec<Output>, message: Vec<u8> },
    /// Block reward payout. Only valid as transaction 0 of a block and is
    /// never gossiped standalone; the envelope nonce carries the height so
    /// coinbases at different heights never collide.
    Coinbase { recipient: Address, amount: u64 },
    /// Opaque payload, optionally directed at a recipient.
    Message { payload: Vec<u8>, recipient: Option<Address> },
    /// Declare a new token; the token id is this transaction's hash.
    TokenCreate {
        symbol: Vec<u8>,
        name: Vec<u8>,
        owner: Address,
        decimals: u8,
        initial_balances: Vec<Output>,
    },
    /// Move token units created by `token`.
    TokenTransfer { token: TxHash, outputs: Vec<Output> },
    /// Register delegated signing keys on the master account.
    Slave { keys: Vec<SlaveKey> },
    /// Create a multi-sig account; its address derives from this tx hash.
    MultiSigCreate {
        signatories: Vec<Address>,
        weights: Vec<u64>,
        threshold: u64,
    },
    /// Propose a payout from a multi-sig account, open until `expiry`.
    MultiSigSpend {
        multi_sig_address: Address,
        outputs: Vec<Output>,
        expiry_block_number: u64,
    },
    /// Vote (or withdraw a vote) on a pending multi-sig spend.
    MultiSigVote { spend_tx: TxHash, unvote: bool },
}

const TAG_TRANSFER: u8 = 0x00;
const TAG_COINBASE: u8 = 0x01;
const TAG_MESSAGE: u8 = 0x02;
const TAG_TOKEN_CREATE: u8 = 0x03;
const TAG_TOKEN_TRANSFER: u8 = 0x04;
const TAG_SLAVE: u8 = 0x05;
const TAG_MULTISIG_CREATE: u8 = 0x06;
const TAG_MULTISIG_SPEND: u8 = 0x07;
const TAG_MULTISIG_VOTE: u8 = 0x08;

impl TxKind {
    pub fn name(&self) -> &'static str {
        match self {
            TxKind::Transfer { .. } => "transfer",
            TxKind::Coinbase { .. } => "coinbase",
            TxKind::Message { .. } => "message",
            TxKind::TokenCreate { .. } => "token_create",
            TxKind::TokenTransfer { .. } => "token_transfer",
            TxKind::Slave { .. } => "slave",
            TxKind::MultiSigCreate { .. } => "multisig_create",
            TxKind::MultiSigSpend { .. } => "multisig_spend",
            TxKind::MultiSigVote { .. } => "multisig_vote",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            TxKind::Transfer { .. } => TAG_TRANSFER,
            TxKind::Coinbase { .. } => TAG_COINBASE,
            TxKind::Message { .. } => TAG_MESSAGE,
            TxKind::TokenCreate { .. } => TAG_TOKEN_CREATE,
            TxKind::TokenTransfer { .. } => TAG_TOKEN_TRANSFER,
            TxKind::Slave { .. } => TAG_SLAVE,
            TxKind::MultiSigCreate { .. } => TAG_MULTISIG_CREATE,
            TxKind::MultiSigSpend { .. } => TAG_MULTISIG_SPEND,
            TxKind::MultiSigVote { .. } => TAG_MULTISIG_VOTE,
        }
    }
}

fn encode_outputs(outputs: &[Output], out: &mut Vec<u8>) {
    out.put_u32(outputs.len() as u32);
    for output in outputs {
        out.put_address(&output.recipient);
        out.put_u64(output.amount);
    }
}

fn decode_outputs(reader: &mut Reader<'_>) -> Result<Vec<Output>> {
    reader.vec(MAX_OUTPUTS, |r| {
        Ok(Output {
            recipient: r.address()?,
            amount: r.u64()?,
        })
    })
}

impl WireEncode for TxKind {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_u8(self.tag());
        match self {
            TxKind::Transfer { outputs, message } => {
                encode_outputs(outputs, out);
                out.put_bytes(message);
            }
            TxKind::Coinbase { recipient, amount } => {
                out.put_address(recipient);
                out.put_u64(*amount);
            }
            TxKind::Message { payload, recipient } => {
                out.put_bytes(payload);
                match recipient {
                    Some(addr) => {
                        out.put_bool(true);
                        out.put_address(addr);
                    }
                    None => out.put_bool(false),
                }
            }
            TxKind::TokenCreate {
                symbol,
                name,
                owner,
                decimals,
                initial_balances,
            } => {
                out.put_bytes(symbol);
                out.put_bytes(name);
                out.put_address(owner);
                out.put_u8(*decimals);
                encode_outputs(initial_balances, out);
            }
            TxKind::TokenTransfer { token, outputs } => {
                out.put_hash(token);
                encode_outputs(outputs, out);
            }
            TxKind::Slave { keys } => {
                out.put_u32(keys.len() as u32);
                for key in keys {
                    out.put_bytes(&key.public_key);
                    out.put_u8(key.access_type);
                }
            }
            TxKind::MultiSigCreate {
                signatories,
                weights,
                threshold,
            } => {
                out.put_u32(signatories.len() as u32);
                for addr in signatories {
                    out.put_address(addr);
                }
                out.put_u32(weights.len() as u32);
                for weight in weights {
                    out.put_u64(*weight);
                }
                out.put_u64(*threshold);
            }
            TxKind::MultiSigSpend {
                multi_sig_address,
                outputs,
                expiry_block_number,
            } => {
                out.put_address(multi_sig_address);
                encode_outputs(outputs, out);
                out.put_u64(*expiry_block_number);
            }
            TxKind::MultiSigVote { spend_tx, unvote } => {
                out.put_hash(spend_tx);
                out.put_bool(*unvote);
            }
        }
    }
}

impl WireDecode for TxKind {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let tag = reader.u8()?;
        match tag {
            TAG_TRANSFER => Ok(TxKind::Transfer {
                outputs: decode_outputs(reader)?,
                message: reader.bytes(crate::wire::MAX_FIELD_BYTES)?,
            }),
            TAG_COINBASE => Ok(TxKind::Coinbase {
                recipient: reader.address()?,
                amount: reader.u64()?,
            }),
            TAG_MESSAGE => {
                let payload = reader.bytes(crate::wire::MAX_FIELD_BYTES)?;
                let recipient = if reader.bool()? {
                    Some(reader.address()?)
                } else {
                    None
                };
                Ok(TxKind::Message { payload, recipient })
            }
            TAG_TOKEN_CREATE => Ok(TxKind::TokenCreate {
                symbol: reader.bytes(MAX_TOKEN_SYMBOL_LEN)?,
                name: reader.bytes(MAX_TOKEN_NAME_LEN)?,
                owner: reader.address()?,
                decimals: reader.u8()?,
                initial_balances: decode_outputs(reader)?,
            }),
            TAG_TOKEN_TRANSFER => Ok(TxKind::TokenTransfer {
                token: reader.hash()?,
                outputs: decode_outputs(reader)?,
            }),
            TAG_SLAVE => {
                let keys = reader.vec(MAX_SLAVE_KEYS, |r| {
                    Ok(SlaveKey {
                        public_key: r.bytes(FALCON_PUBKEY_SIZE)?,
                        access_type: r.u8()?,
                    })
                })?;
                Ok(TxKind::Slave { keys })
            }
            TAG_MULTISIG_CREATE => {
                let signatories = reader.vec(MAX_SIGNATORIES, |r| r.address())?;
                let weights = reader.vec(MAX_SIGNATORIES, |r| r.u64())?;
                let threshold = reader.u64()?;
                Ok(TxKind::MultiSigCreate {
                    signatories,
                    weights,
                    threshold,
                })
            }
            TAG_MULTISIG_SPEND => Ok(TxKind::MultiSigSpend {
                multi_sig_address: reader.address()?,
                outputs: decode_outputs(reader)?,
                expiry_block_number: reader.u64()?,
            }),
            TAG_MULTISIG_VOTE => Ok(TxKind::MultiSigVote {
                spend_tx: reader.hash()?,
                unvote: reader.bool()?,
            }),
            other => Err(CoreError::Malformed(format!(
                "unknown transaction tag {other:#04x}"
            ))),
        }
    }
}

/// A transaction: common envelope plus a [`TxKind`] payload.
///
/// The signature covers `hash256(canonical_bytes)`, where `canonical_bytes`
/// is the wire encoding with the signature field emptied; the hash doubles
/// as the transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub master_addr: Address,
    pub fee: u64,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub nonce: u64,
    pub kind: TxKind,
}

impl WireEncode for Transaction {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.encode_with_signature(&self.signature, out);
    }
}

impl WireDecode for Transaction {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(Transaction {
            master_addr: reader.address()?,
            fee: reader.u64()?,
            nonce: reader.u64()?,
            public_key: reader.bytes(FALCON_PUBKEY_SIZE)?,
            signature: reader.bytes(FALCON_SIG_MAX_SIZE)?,
            kind: TxKind::decode_from(reader)?,
        })
    }
}

impl Transaction {
    pub fn new(master_addr: Address, fee: u64, nonce: u64, kind: TxKind) -> Self {
        Self {
            master_addr,
            fee,
            public_key: Vec::new(),
            signature: Vec::new(),
            nonce,
            kind,
        }
    }

    /// Construct the system coinbase for a block. Unsigned by design; the
    /// height rides in the nonce so every coinbase hash is unique.
    pub fn coinbase(recipient: Address, amount: u64, height: u64) -> Self {
        Self::new(recipient, 0, height, TxKind::Coinbase { recipient, amount })
    }

    fn encode_with_signature(&self, signature: &[u8], out: &mut Vec<u8>) {
        out.put_address(&self.master_addr);
        out.put_u64(self.fee);
        out.put_u64(self.nonce);
        out.put_bytes(&self.public_key);
        out.put_bytes(signature);
        self.kind.encode_into(out);
    }

    /// Signing pre-image: the wire encoding with an empty signature field.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_with_signature(&[], &mut out);
        out
    }

    /// Transaction id: SHA3-256 of the canonical bytes.
    pub fn hash(&self) -> TxHash {
        crypto::hash256(&self.canonical_bytes())
    }

    pub fn size_bytes(&self) -> usize {
        self.encode().len()
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, TxKind::Coinbase { .. })
    }

    /// Sign with `keypair`, installing its public key into the envelope.
    pub fn sign(&mut self, keypair: &FalconKeypair) -> Result<()> {
        self.public_key = keypair.public_key().to_vec();
        let digest = self.hash();
        self.signature = keypair.sign(&digest)?;
        Ok(())
    }

    pub fn verify_signature(&self) -> bool {
        if self.is_coinbase() {
            return self.signature.is_empty() && self.public_key.is_empty();
        }
        crypto::verify(&self.public_key, &self.hash(), &self.signature)
    }

    /// Fee per byte rounded up; the mempool priority metric.
    pub fn fee_rate(&self) -> u64 {
        let size = self.size_bytes().max(1) as u64;
        self.fee.div_ceil(size)
    }

    /// Quark debit this transaction takes from the signer's balance
    /// (outputs in coin plus fee). Token amounts are not quarks and
    /// multi-sig spends debit the multi-sig account at execution time.
    pub fn required_balance(&self) -> Result<u64> {
        let outputs_total = match &self.kind {
            TxKind::Transfer { outputs, .. } => sum_outputs(outputs)?,
            _ => 0,
        };
        outputs_total
            .checked_add(self.fee)
            .ok_or_else(|| CoreError::InvalidTransaction("amount overflow".into()))
    }

    /// Stateless validation: bounds, sizes and structural rules. Nothing
    /// here touches chain state or the network.
    pub fn basic_validate(&self, consensus: &ConsensusConfig) -> Result<()> {
        let size = self.size_bytes();
        if size > consensus.max_tx_bytes {
            return Err(CoreError::InvalidTransaction(format!(
                "transaction size {size} exceeds limit {}",
                consensus.max_tx_bytes
            )));
        }

        if self.is_coinbase() {
            if self.fee != 0 {
                return Err(CoreError::InvalidTransaction("coinbase cannot carry a fee".into()));
            }
            if !self.signature.is_empty() || !self.public_key.is_empty() {
                return Err(CoreError::InvalidTransaction("coinbase must be unsigned".into()));
            }
        } else {
            if self.public_key.len() != FALCON_PUBKEY_SIZE {
                return Err(CoreError::InvalidTransaction(format!(
                    "bad public key size {}",
                    self.public_key.len()
                )));
            }
            if self.signature.is_empty() || self.signature.len() > FALCON_SIG_MAX_SIZE {
                return Err(CoreError::InvalidTransaction("bad signature size".into()));
            }
        }

        self.required_balance()?;

        match &self.kind {
            TxKind::Transfer { outputs, message } => {
                validate_outputs(outputs)?;
                if message.len() > consensus.max_message_bytes {
                    return Err(CoreError::InvalidTransaction("transfer note too large".into()));
                }
            }
            TxKind::Coinbase { amount, .. } => {
                if *amount == 0 {
                    return Err(CoreError::InvalidTransaction("empty coinbase".into()));
                }
            }
            TxKind::Message { payload, .. } => {
                if payload.is_empty() {
                    return Err(CoreError::InvalidTransaction("empty message payload".into()));
                }
                if payload.len() > consensus.max_message_bytes {
                    return Err(CoreError::InvalidTransaction(format!(
                        "message payload {} exceeds limit {}",
                        payload.len(),
                        consensus.max_message_bytes
                    )));
                }
            }
            TxKind::TokenCreate {
                symbol,
                name,
                decimals,
                initial_balances,
                ..
            } => {
                if symbol.is_empty() || symbol.len() > MAX_TOKEN_SYMBOL_LEN {
                    return Err(CoreError::InvalidTransaction("bad token symbol length".into()));
                }
                if name.is_empty() || name.len() > MAX_TOKEN_NAME_LEN {
                    return Err(CoreError::InvalidTransaction("bad token name length".into()));
                }
                if *decimals > MAX_TOKEN_DECIMALS {
                    return Err(CoreError::InvalidTransaction("too many token decimals".into()));
                }
                validate_outputs(initial_balances)?;
            }
            TxKind::TokenTransfer { outputs, .. } => {
                validate_outputs(outputs)?;
            }
            TxKind::Slave { keys } => {
                if keys.is_empty() || keys.len() > MAX_SLAVE_KEYS {
                    return Err(CoreError::InvalidTransaction("bad slave key count".into()));
                }
                for key in keys {
                    if key.public_key.len() != FALCON_PUBKEY_SIZE {
                        return Err(CoreError::InvalidTransaction("bad slave public key size".into()));
                    }
                    if key.access_type > SLAVE_ACCESS_MINT_ONLY {
                        return Err(CoreError::InvalidTransaction(format!(
                            "unknown slave access type {}",
                            key.access_type
                        )));
                    }
                }
            }
            TxKind::MultiSigCreate {
                signatories,
                weights,
                threshold,
            } => {
                if signatories.len() < 2 || signatories.len() > MAX_SIGNATORIES {
                    return Err(CoreError::InvalidTransaction("bad signatory count".into()));
                }
                if signatories.len() != weights.len() {
                    return Err(CoreError::InvalidTransaction(
                        "signatory and weight counts differ".into(),
                    ));
                }
                let mut seen = std::collections::HashSet::new();
                for addr in signatories {
                    if !seen.insert(*addr) {
                        return Err(CoreError::InvalidTransaction("duplicate signatory".into()));
                    }
                }
                let mut total: u64 = 0;
                for weight in weights {
                    if *weight == 0 {
                        return Err(CoreError::InvalidTransaction("zero signatory weight".into()));
                    }
                    total = total
                        .checked_add(*weight)
                        .ok_or_else(|| CoreError::InvalidTransaction("weight overflow".into()))?;
                }
                if *threshold == 0 || *threshold > total {
                    return Err(CoreError::InvalidTransaction(format!(
                        "threshold {threshold} outside 1..={total}"
                    )));
                }
            }
            TxKind::MultiSigSpend { outputs, .. } => {
                validate_outputs(outputs)?;
            }
            TxKind::MultiSigVote { .. } => {}
        }

        Ok(())
    }
}

fn validate_outputs(outputs: &[Output]) -> Result<()> {
    if outputs.is_empty() || outputs.len() > MAX_OUTPUTS {
        return Err(CoreError::InvalidTransaction(format!(
            "output count {} outside 1..={MAX_OUTPUTS}",
            outputs.len()
        )));
    }
    for output in outputs {
        if output.amount == 0 {
            return Err(CoreError::InvalidTransaction("zero-amount output".into()));
        }
    }
    sum_outputs(outputs)?;
    Ok(())
}

/// Checked sum of output amounts.
pub fn sum_outputs(outputs: &[Output]) -> Result<u64> {
    let mut total: u64 = 0;
    for output in outputs {
        total = total
            .checked_add(output.amount)
            .ok_or_else(|| CoreError::InvalidTransaction("output sum overflow".into()))?;
    }
    Ok(total)
}
