//! Wire protocol: one-byte function codes and payload codecs.
//!
//! Every frame on a peer stream is `len(4, BE) || func_code(1) || payload`.
//! The function-code names follow the legacy protocol this chain descends
//! from; transactions keep their per-type codes so a peer can score traffic
//! without decoding payloads.

use crate::block::Block;
use crate::crypto::Hash32;
use crate::error::CoreError;
use crate::transaction::{Transaction, TxKind};
use crate::wire::{Reader, WireDecode, WireEncode, Writer};
use crate::Result;

pub const PROTOCOL_VERSION: u32 = 3;

/// Function codes.
mod fc {
    pub const VE: u8 = 0x01;
    pub const PL: u8 = 0x02;
    pub const PONG: u8 = 0x03;
    pub const MR: u8 = 0x04;
    pub const SFM: u8 = 0x05;
    pub const BK: u8 = 0x06;
    pub const FB: u8 = 0x07;
    pub const PB: u8 = 0x08;
    pub const BH: u8 = 0x09;
    pub const TX: u8 = 0x10;
    pub const MT: u8 = 0x11;
    pub const TK: u8 = 0x12;
    pub const TT: u8 = 0x13;
    pub const SL: u8 = 0x14;
    pub const MC: u8 = 0x15;
    pub const MS: u8 = 0x16;
    pub const MV: u8 = 0x17;
    pub const LT: u8 = 0x18;
    pub const SYNC: u8 = 0x20;
    pub const CHAINSTATE: u8 = 0x21;
    pub const HEADERHASHES: u8 = 0x22;
    pub const ACK: u8 = 0x23;
}

/// What an `MR` announcement or `SFM` request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    Block,
    Transfer,
    Message,
    TokenCreate,
    TokenTransfer,
    Slave,
    MultiSigCreate,
    MultiSigSpend,
    MultiSigVote,
}

impl InvKind {
    pub fn for_tx(tx: &Transaction) -> Result<InvKind> {
        Ok(match tx.kind {
            TxKind::Transfer { .. } => InvKind::Transfer,
            TxKind::Message { .. } => InvKind::Message,
            TxKind::TokenCreate { .. } => InvKind::TokenCreate,
            TxKind::TokenTransfer { .. } => InvKind::TokenTransfer,
            TxKind::Slave { .. } => InvKind::Slave,
            TxKind::MultiSigCreate { .. } => InvKind::MultiSigCreate,
            TxKind::MultiSigSpend { .. } => InvKind::MultiSigSpend,
            TxKind::MultiSigVote { .. } => InvKind::MultiSigVote,
            TxKind::Coinbase { .. } => {
                return Err(CoreError::InvalidTransaction(
                    "coinbase is never announced".into(),
                ))
            }
        })
    }

    fn code(&self) -> u8 {
        match self {
            InvKind::Block => fc::BK,
            InvKind::Transfer => fc::TX,
            InvKind::Message => fc::MT,
            InvKind::TokenCreate => fc::TK,
            InvKind::TokenTransfer => fc::TT,
            InvKind::Slave => fc::SL,
            InvKind::MultiSigCreate => fc::MC,
            InvKind::MultiSigSpend => fc::MS,
            InvKind::MultiSigVote => fc::MV,
        }
    }

    fn from_code(code: u8) -> Result<InvKind> {
        Ok(match code {
            fc::BK => InvKind::Block,
            fc::TX => InvKind::Transfer,
            fc::MT => InvKind::Message,
            fc::TK => InvKind::TokenCreate,
            fc::TT => InvKind::TokenTransfer,
            fc::SL => InvKind::Slave,
            fc::MC => InvKind::MultiSigCreate,
            fc::MS => InvKind::MultiSigSpend,
            fc::MV => InvKind::MultiSigVote,
            other => {
                return Err(CoreError::Malformed(format!(
                    "unknown inventory code {other:#04x}"
                )))
            }
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetMessage {
    /// Handshake. Carries the genesis hash as the network partition key and
    /// the sender's declared inbound rate limit in bytes per second.
    Version {
        protocol_version: u32,
        genesis_hash: Hash32,
        rate_limit: u64,
        best_height: u64,
    },
    /// Known peer addresses, `host:port` strings.
    PeerList { peers: Vec<String> },
    /// Keepalive.
    Pong,
    /// Inventory announcement: "I have this item".
    Announce { hash: Hash32, kind: InvKind },
    /// Request the full item behind an announcement.
    RequestFull { hash: Hash32, kind: InvKind },
    /// A gossiped block.
    Block { block: Block },
    /// Request the main-chain block at a height.
    FetchBlock { height: u64 },
    /// Answer to [`NetMessage::FetchBlock`].
    PushBlock { block: Block },
    /// Tip-height probe and answer.
    BlockHeight { height: u64, tip_hash: Hash32 },
    /// A gossiped transaction. On the wire it travels under its per-type
    /// function code.
    Transaction { tx: Transaction },
    /// Lookup of a not-yet-confirmed transaction.
    LookupTx { hash: Hash32 },
    /// Ask the peer for its chain state.
    Sync,
    /// Advertised tip: the fork-choice metric peers sync by.
    ChainState {
        height: u64,
        tip_hash: Hash32,
        cumulative_work: Hash32,
    },
    /// A window of consecutive main-chain header hashes starting at
    /// `start_height`. An empty window is a request for one.
    HeaderHashes {
        start_height: u64,
        hashes: Vec<Hash32>,
    },
    /// Flow control: cumulative count of payload bytes processed.
    Ack { bytes_processed: u64 },
}

/// Longest header-hash window served in one message.
pub const MAX_HEADER_WINDOW: usize = 512;
const MAX_PEER_ADDRS: usize = 256;
const MAX_ADDR_LEN: usize = 64;

impl NetMessage {
    pub fn func_name(&self) -> &'static str {
        match self {
            NetMessage::Version { .. } => "VE",
            NetMessage::PeerList { .. } => "PL",
            NetMessage::Pong => "PONG",
            NetMessage::Announce { .. } => "MR",
            NetMessage::RequestFull { .. } => "SFM",
            NetMessage::Block { .. } => "BK",
            NetMessage::FetchBlock { .. } => "FB",
            NetMessage::PushBlock { .. } => "PB",
            NetMessage::BlockHeight { .. } => "BH",
            NetMessage::Transaction { tx } => match tx.kind {
                TxKind::Transfer { .. } => "TX",
                TxKind::Message { .. } => "MT",
                TxKind::TokenCreate { .. } => "TK",
                TxKind::TokenTransfer { .. } => "TT",
                TxKind::Slave { .. } => "SL",
                TxKind::MultiSigCreate { .. } => "MC",
                TxKind::MultiSigSpend { .. } => "MS",
                TxKind::MultiSigVote { .. } => "MV",
                TxKind::Coinbase { .. } => "??",
            },
            NetMessage::LookupTx { .. } => "LT",
            NetMessage::Sync => "SYNC",
            NetMessage::ChainState { .. } => "CHAINSTATE",
            NetMessage::HeaderHashes { .. } => "HEADERHASHES",
            NetMessage::Ack { .. } => "ACK",
        }
    }
}

impl WireEncode for NetMessage {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            NetMessage::Version {
                protocol_version,
                genesis_hash,
                rate_limit,
                best_height,
            } => {
                out.put_u8(fc::VE);
                out.put_u32(*protocol_version);
                out.put_hash(genesis_hash);
                out.put_u64(*rate_limit);
                out.put_u64(*best_height);
            }
            NetMessage::PeerList { peers } => {
                out.put_u8(fc::PL);
                out.put_u32(peers.len() as u32);
                for peer in peers {
                    out.put_bytes(peer.as_bytes());
                }
            }
            NetMessage::Pong => out.put_u8(fc::PONG),
            NetMessage::Announce { hash, kind } => {
                out.put_u8(fc::MR);
                out.put_hash(hash);
                out.put_u8(kind.code());
            }
            NetMessage::RequestFull { hash, kind } => {
                out.put_u8(fc::SFM);
                out.put_hash(hash);
                out.put_u8(kind.code());
            }
            NetMessage::Block { block } => {
                out.put_u8(fc::BK);
                block.encode_into(out);
            }
            NetMessage::FetchBlock { height } => {
                out.put_u8(fc::FB);
                out.put_u64(*height);
            }
            NetMessage::PushBlock { block } => {
                out.put_u8(fc::PB);
                block.encode_into(out);
            }
            NetMessage::BlockHeight { height, tip_hash } => {
                out.put_u8(fc::BH);
                out.put_u64(*height);
                out.put_hash(tip_hash);
            }
            NetMessage::Transaction { tx } => {
                let code = InvKind::for_tx(tx).map(|kind| kind.code()).unwrap_or(fc::TX);
                out.put_u8(code);
                tx.encode_into(out);
            }
            NetMessage::LookupTx { hash } => {
                out.put_u8(fc::LT);
                out.put_hash(hash);
            }
            NetMessage::Sync => out.put_u8(fc::SYNC),
            NetMessage::ChainState {
                height,
                tip_hash,
                cumulative_work,
            } => {
                out.put_u8(fc::CHAINSTATE);
                out.put_u64(*height);
                out.put_hash(tip_hash);
                out.put_hash(cumulative_work);
            }
            NetMessage::HeaderHashes {
                start_height,
                hashes,
            } => {
                out.put_u8(fc::HEADERHASHES);
                out.put_u64(*start_height);
                out.put_u32(hashes.len() as u32);
                for hash in hashes {
                    out.put_hash(hash);
                }
            }
            NetMessage::Ack { bytes_processed } => {
                out.put_u8(fc::ACK);
                out.put_u64(*bytes_processed);
            }
        }
    }
}

impl WireDecode for NetMessage {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let code = reader.u8()?;
        match code {
            fc::VE => Ok(NetMessage::Version {
                protocol_version: reader.u32()?,
                genesis_hash: reader.hash()?,
                rate_limit: reader.u64()?,
                best_height: reader.u64()?,
            }),
            fc::PL => {
                let peers = reader.vec(MAX_PEER_ADDRS, |r| {
                    let bytes = r.bytes(MAX_ADDR_LEN)?;
                    String::from_utf8(bytes)
                        .map_err(|_| CoreError::Malformed("peer address is not utf-8".into()))
                })?;
                Ok(NetMessage::PeerList { peers })
            }
            fc::PONG => Ok(NetMessage::Pong),
            fc::MR => Ok(NetMessage::Announce {
                hash: reader.hash()?,
                kind: InvKind::from_code(reader.u8()?)?,
            }),
            fc::SFM => Ok(NetMessage::RequestFull {
                hash: reader.hash()?,
                kind: InvKind::from_code(reader.u8()?)?,
            }),
            fc::BK => Ok(NetMessage::Block {
                block: Block::decode_from(reader)?,
            }),
            fc::FB => Ok(NetMessage::FetchBlock {
                height: reader.u64()?,
            }),
            fc::PB => Ok(NetMessage::PushBlock {
                block: Block::decode_from(reader)?,
            }),
            fc::BH => Ok(NetMessage::BlockHeight {
                height: reader.u64()?,
                tip_hash: reader.hash()?,
            }),
            fc::TX | fc::MT | fc::TK | fc::TT | fc::SL | fc::MC | fc::MS | fc::MV => {
                let tx = Transaction::decode_from(reader)?;
                let expected = InvKind::for_tx(&tx)?.code();
                if expected != code {
                    return Err(CoreError::Malformed(format!(
                        "transaction kind does not match function code {code:#04x}"
                    )));
                }
                Ok(NetMessage::Transaction { tx })
            }
            fc::LT => Ok(NetMessage::LookupTx {
                hash: reader.hash()?,
            }),
            fc::SYNC => Ok(NetMessage::Sync),
            fc::CHAINSTATE => Ok(NetMessage::ChainState {
                height: reader.u64()?,
                tip_hash: reader.hash()?,
                cumulative_work: reader.hash()?,
            }),
            fc::HEADERHASHES => {
                let start_height = reader.u64()?;
                let hashes = reader.vec(MAX_HEADER_WINDOW, |r| r.hash())?;
                Ok(NetMessage::HeaderHashes {
                    start_height,
                    hashes,
                })
            }
            fc::ACK => Ok(NetMessage::Ack {
                bytes_processed: reader.u64()?,
            }),
            other => Err(CoreError::Malformed(format!(
                "unknown function code {other:#04x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkParams, NetworkType};
    use crate::crypto::Address;
    use crate::transaction::Output;

    fn sample_tx(kind: TxKind) -> Transaction {
        let params = NetworkParams::for_network(NetworkType::Dev);
        Transaction::new(Address::from_seed(params.address_version, "p2p"), 1, 1, kind)
    }

    #[test]
    fn round_trip_control_messages() {
        let messages = vec![
            NetMessage::Version {
                protocol_version: PROTOCOL_VERSION,
                genesis_hash: [1u8; 32],
                rate_limit: 512 * 1024,
                best_height: 42,
            },
            NetMessage::PeerList {
                peers: vec!["10.0.0.1:9567".to_string(), "peer.example:9567".to_string()],
            },
            NetMessage::Pong,
            NetMessage::Announce {
                hash: [2u8; 32],
                kind: InvKind::Block,
            },
            NetMessage::RequestFull {
                hash: [3u8; 32],
                kind: InvKind::Transfer,
            },
            NetMessage::FetchBlock { height: 7 },
            NetMessage::BlockHeight {
                height: 9,
                tip_hash: [4u8; 32],
            },
            NetMessage::LookupTx { hash: [5u8; 32] },
            NetMessage::Sync,
            NetMessage::ChainState {
                height: 100,
                tip_hash: [6u8; 32],
                cumulative_work: [7u8; 32],
            },
            NetMessage::HeaderHashes {
                start_height: 10,
                hashes: vec![[8u8; 32], [9u8; 32]],
            },
            NetMessage::HeaderHashes {
                start_height: 10,
                hashes: vec![],
            },
            NetMessage::Ack {
                bytes_processed: 123_456,
            },
        ];
        for message in messages {
            let decoded = NetMessage::decode(&message.encode()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn transactions_travel_under_their_type_code() {
        let params = NetworkParams::for_network(NetworkType::Dev);
        let recipient = Address::from_seed(params.address_version, "r");
        let cases: Vec<(TxKind, u8)> = vec![
            (
                TxKind::Transfer {
                    outputs: vec![Output {
                        recipient,
                        amount: 5,
                    }],
                    message: Vec::new(),
                },
                0x10,
            ),
            (
                TxKind::Message {
                    payload: b"m".to_vec(),
                    recipient: None,
                },
                0x11,
            ),
            (
                TxKind::MultiSigVote {
                    spend_tx: [1u8; 32],
                    unvote: false,
                },
                0x17,
            ),
        ];
        for (kind, code) in cases {
            let message = NetMessage::Transaction {
                tx: sample_tx(kind),
            };
            let bytes = message.encode();
            assert_eq!(bytes[0], code);
            assert_eq!(NetMessage::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn mismatched_tx_code_is_malformed() {
        let params = NetworkParams::for_network(NetworkType::Dev);
        let recipient = Address::from_seed(params.address_version, "r");
        let message = NetMessage::Transaction {
            tx: sample_tx(TxKind::Transfer {
                outputs: vec![Output {
                    recipient,
                    amount: 5,
                }],
                message: Vec::new(),
            }),
        };
        let mut bytes = message.encode();
        bytes[0] = 0x11; // claim it is a message-kind transaction
        assert!(matches!(
            NetMessage::decode(&bytes),
            Err(CoreError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_code_is_malformed() {
        assert!(matches!(
            NetMessage::decode(&[0x7f, 0, 0]),
            Err(CoreError::Malformed(_))
        ));
    }

    #[test]
    fn block_messages_round_trip() {
        let params = NetworkParams::for_network(NetworkType::Dev);
        let miner = Address::from_seed(params.address_version, "miner");
        let coinbase = Transaction::coinbase(miner, 100, 1);
        let block = Block {
            header: crate::block::BlockHeader {
                prev_hash: [1u8; 32],
                block_number: 1,
                timestamp: 1_714_521_760,
                merkle_root: Block::merkle_root(std::slice::from_ref(&coinbase)),
                difficulty_bits: 0x207fffff,
                mining_nonce: 3,
                extra_nonce: 4,
                block_reward: 100,
                fee_reward: 0,
            },
            transactions: vec![coinbase],
        };
        for message in [
            NetMessage::Block {
                block: block.clone(),
            },
            NetMessage::PushBlock { block },
        ] {
            assert_eq!(NetMessage::decode(&message.encode()).unwrap(), message);
        }
    }
}
