//! Node assembly: wires the store, chain manager, mempool, P2P overlay,
//! syncer and miner together, and routes decoded peer messages.

use std::sync::Arc;
use std::time::Duration;

use primitive_types::U256;
use tokio::sync::mpsc;

use crate::block::Block;
use crate::chain::{BlockAccept, BlockSource, ChainManager};
use crate::config::Config;
use crate::crypto::Address;
use crate::error::CoreError;
use crate::mempool::Mempool;
use crate::miner::Miner;
use crate::p2p::message::{InvKind, NetMessage, MAX_HEADER_WINDOW};
use crate::p2p::peer::PeerId;
use crate::p2p::{P2pService, PeerEvent};
use crate::store::Store;
use crate::sync::Syncer;
use crate::Result;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

pub struct Node {
    config: Config,
    store: Arc<Store>,
    chain: Arc<ChainManager>,
    mempool: Arc<Mempool>,
    p2p: Arc<P2pService>,
    syncer: Arc<Syncer>,
    miner: Option<Miner>,
}

impl Node {
    /// Bring the node up: storage recovery, genesis, networking, sync and
    /// (optionally) mining.
    pub async fn start(config: Config) -> Result<Arc<Node>> {
        config.validate()?;
        let params = config.params();
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(Store::open(&config.data_dir, params.magic, &config.storage)?);
        let mempool = Arc::new(Mempool::new(
            config.mempool.clone(),
            config.consensus.clone(),
            params.address_version,
        ));
        let chain = Arc::new(ChainManager::open(
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&mempool),
        )?);
        let (tip, height) = chain.tip();
        log::info!(
            "chain ready on {}: height {height}, tip {}",
            params.network.as_str(),
            hex::encode(tip)
        );

        if config.storage.persist_mempool {
            match mempool.load_snapshot(&store, height) {
                Ok(restored) if restored > 0 => log::info!("restored {restored} mempool entries"),
                Ok(_) => {}
                Err(err) => log::warn!("mempool snapshot unusable: {err}"),
            }
        }

        let genesis_hash = ChainManager::genesis_block(&config).hash();
        let (events_tx, events_rx) = mpsc::channel::<PeerEvent>(1_024);
        let p2p = P2pService::new(config.p2p.clone(), genesis_hash, params.bootstrap, events_tx);
        let _ = p2p.load_address_book(&config.data_dir.join("peers.dat"));
        p2p.set_best_height(height);
        Arc::clone(&p2p).start().await?;

        let syncer = Arc::new(Syncer::new(Arc::clone(&chain), Arc::clone(&p2p)));

        let (announce_tx, announce_rx) = mpsc::unbounded_channel::<Block>();
        let miner = match &config.mining.mining_address {
            Some(addr) if config.mining.mining_threads > 0 => {
                let coinbase = Address::from_string(addr, params)?;
                Miner::spawn(Arc::clone(&chain), &config.mining, coinbase, announce_tx)?
            }
            _ => None,
        };

        let node = Arc::new(Node {
            config,
            store,
            chain,
            mempool,
            p2p,
            syncer,
            miner,
        });

        Node::spawn_router(Arc::clone(&node), events_rx, announce_rx);
        Node::spawn_housekeeping(Arc::clone(&node));
        Ok(node)
    }

    pub fn chain(&self) -> &Arc<ChainManager> {
        &self.chain
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn p2p(&self) -> &Arc<P2pService> {
        &self.p2p
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.syncer.is_syncing()
    }

    /// Flush sidecars and stop the workers. The chain state itself is
    /// durable at every accepted block.
    pub fn shutdown(&self) {
        if let Some(miner) = &self.miner {
            miner.shutdown();
        }
        if self.config.storage.persist_mempool {
            if let Err(err) = self.mempool.persist_snapshot(&self.store) {
                log::warn!("mempool snapshot failed: {err}");
            }
        }
        let _ = self
            .p2p
            .persist_address_book(&self.config.data_dir.join("peers.dat"));
        log::info!("node shut down");
    }

    fn spawn_router(
        node: Arc<Self>,
        mut events_rx: mpsc::Receiver<PeerEvent>,
        mut announce_rx: mpsc::UnboundedReceiver<Block>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        let Some(event) = event else { break };
                        node.handle_event(event);
                    }
                    mined = announce_rx.recv() => {
                        let Some(block) = mined else { break };
                        node.announce_block(&block, None);
                    }
                }
            }
        });
    }

    fn spawn_housekeeping(node: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                ticker.tick().await;
                node.mempool.expire_old();
                node.syncer.on_tick();
                let (_, height) = node.chain.tip();
                node.p2p.set_best_height(height);
            }
        });
    }

    fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer, best_height } => {
                // Introduce ourselves: chain state, a probe of theirs, and
                // a slice of our address book.
                self.p2p.send(&peer, self.chain_state_message());
                self.p2p.send(&peer, NetMessage::Sync);
                let peers = self.p2p.known_addrs();
                if !peers.is_empty() {
                    self.p2p.send(&peer, NetMessage::PeerList { peers });
                }
                let (_, our_height) = self.chain.tip();
                if best_height > our_height {
                    log::info!("peer {peer} is ahead ({best_height} > {our_height})");
                }
            }
            PeerEvent::Disconnected { .. } => {}
            PeerEvent::Message { peer, message } => self.handle_message(peer, message),
        }
    }

    fn chain_state_message(&self) -> NetMessage {
        let (tip, height) = self.chain.tip();
        let mut work = [0u8; 32];
        self.chain.cumulative_difficulty().to_big_endian(&mut work);
        NetMessage::ChainState {
            height,
            tip_hash: tip,
            cumulative_work: work,
        }
    }

    fn announce_block(&self, block: &Block, except: Option<PeerId>) {
        let hash = block.hash();
        self.p2p.mark_seen(hash);
        self.p2p.broadcast(
            &NetMessage::Announce {
                hash,
                kind: InvKind::Block,
            },
            except,
        );
        let (_, height) = self.chain.tip();
        self.p2p.set_best_height(height);
    }

    fn handle_message(&self, peer: PeerId, message: NetMessage) {
        match message {
            NetMessage::Pong => {}
            NetMessage::PeerList { peers } => self.p2p.add_known_addrs(&peers),
            NetMessage::Announce { hash, kind } => {
                if !self.p2p.mark_seen(hash) {
                    return;
                }
                let wanted = match kind {
                    InvKind::Block => !self.chain.has_block(&hash),
                    _ => !self.mempool.contains(&hash),
                };
                if wanted {
                    self.p2p.send(&peer, NetMessage::RequestFull { hash, kind });
                }
            }
            NetMessage::RequestFull { hash, kind } => match kind {
                InvKind::Block => {
                    if let Ok(Some(block)) = self.chain.block_by_hash(&hash) {
                        self.p2p.send(&peer, NetMessage::Block { block });
                    }
                }
                _ => {
                    if let Some(tx) = self.mempool.get(&hash) {
                        self.p2p.send(&peer, NetMessage::Transaction { tx });
                    }
                }
            },
            NetMessage::Block { block } => self.handle_peer_block(peer, block),
            NetMessage::PushBlock { block } => {
                if self.syncer.is_syncing() {
                    let _ = self.syncer.on_push_block(peer, block);
                } else {
                    self.handle_peer_block(peer, block);
                }
            }
            NetMessage::FetchBlock { height } => {
                if let Ok(Some(block)) = self.chain.block_by_height(height) {
                    self.p2p.send(&peer, NetMessage::PushBlock { block });
                }
            }
            NetMessage::BlockHeight { height, .. } => {
                self.p2p.note_best_height(&peer, height);
                let (tip, our_height) = self.chain.tip();
                if height > our_height {
                    self.p2p.send(&peer, NetMessage::Sync);
                } else {
                    self.p2p.send(
                        &peer,
                        NetMessage::BlockHeight {
                            height: our_height,
                            tip_hash: tip,
                        },
                    );
                }
            }
            NetMessage::Transaction { tx } => {
                let kind = match InvKind::for_tx(&tx) {
                    Ok(kind) => kind,
                    Err(_) => {
                        self.p2p.penalize(&peer, 20, "relayed a coinbase");
                        return;
                    }
                };
                let hash = tx.hash();
                match self.chain.submit_transaction(tx) {
                    Ok(_) => {
                        self.p2p.mark_seen(hash);
                        self.p2p
                            .broadcast(&NetMessage::Announce { hash, kind }, Some(peer));
                    }
                    Err(CoreError::DuplicateTx) => {}
                    Err(err) if err.is_bannable() => {
                        self.p2p.penalize(&peer, 20, "invalid transaction");
                    }
                    Err(err) => {
                        log::debug!("transaction from {peer} rejected: {err}");
                    }
                }
            }
            NetMessage::LookupTx { hash } => {
                if let Some(tx) = self.mempool.get(&hash) {
                    self.p2p.send(&peer, NetMessage::Transaction { tx });
                }
            }
            NetMessage::Sync => {
                self.p2p.send(&peer, self.chain_state_message());
            }
            NetMessage::ChainState {
                height,
                cumulative_work,
                ..
            } => {
                self.syncer
                    .on_chain_state(peer, height, U256::from_big_endian(&cumulative_work));
            }
            NetMessage::HeaderHashes {
                start_height,
                hashes,
            } => {
                if hashes.is_empty() {
                    // A request for one of our windows.
                    match self
                        .chain
                        .header_hashes_from(start_height, MAX_HEADER_WINDOW as u64)
                    {
                        Ok(hashes) => self.p2p.send(
                            &peer,
                            NetMessage::HeaderHashes {
                                start_height,
                                hashes,
                            },
                        ),
                        Err(err) => log::warn!("cannot serve headers: {err}"),
                    }
                } else {
                    self.syncer.on_header_hashes(peer, start_height, hashes);
                }
            }
            NetMessage::Ack { .. } | NetMessage::Version { .. } => {
                // Consumed by the session layer.
            }
        }
    }

    fn handle_peer_block(&self, peer: PeerId, block: Block) {
        let parent = block.header.prev_hash;
        match self.chain.submit_block(block.clone(), BlockSource::Peer) {
            Ok(BlockAccept::Connected) | Ok(BlockAccept::Reorged { .. }) => {
                self.announce_block(&block, Some(peer));
            }
            Ok(BlockAccept::SideChain) | Ok(BlockAccept::Duplicate) => {}
            Ok(BlockAccept::Orphaned) => {
                // Chase the missing parent from whoever gave us the child.
                self.p2p.send(
                    &peer,
                    NetMessage::RequestFull {
                        hash: parent,
                        kind: InvKind::Block,
                    },
                );
            }
            Err(err) if err.is_bannable() => {
                self.p2p.penalize(&peer, 50, "invalid block");
            }
            Err(err) => {
                log::debug!("block from {peer} rejected: {err}");
            }
        }
    }
}
