//! Header-first chain synchronization.
//!
//! When a peer advertises more cumulative work, the syncer walks header-hash
//! windows backward to the last common height, validates continuity, then
//! fetches the missing blocks by height in sliding windows and feeds them to
//! the chain manager in order. Peers that serve inconsistent headers or bad
//! blocks are penalized and the next-best source is selected.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use primitive_types::U256;

use crate::block::Block;
use crate::chain::{BlockAccept, BlockSource, ChainManager};
use crate::crypto::Hash32;
use crate::error::CoreError;
use crate::p2p::message::{NetMessage, MAX_HEADER_WINDOW};
use crate::p2p::peer::PeerId;
use crate::p2p::P2pService;
use crate::Result;

const HEADER_WINDOW: u64 = MAX_HEADER_WINDOW as u64;
const BLOCK_WINDOW: u64 = 32;
const WINDOW_TIMEOUT: Duration = Duration::from_secs(30);

enum Phase {
    Idle,
    /// Probing header windows backward for the last common height.
    Locating { probe_end: u64 },
    /// Fetching pre-validated blocks.
    Fetching {
        /// height -> expected hash, from validated header windows.
        expected: BTreeMap<u64, Hash32>,
        buffered: BTreeMap<u64, Block>,
        next_apply: u64,
        next_request: u64,
    },
}

struct SyncState {
    phase: Phase,
    peer: Option<PeerId>,
    target_height: u64,
    target_work: U256,
    deadline: Option<Instant>,
}

pub struct Syncer {
    chain: Arc<ChainManager>,
    p2p: Arc<P2pService>,
    state: Mutex<SyncState>,
}

impl Syncer {
    pub fn new(chain: Arc<ChainManager>, p2p: Arc<P2pService>) -> Self {
        Self {
            chain,
            p2p,
            state: Mutex::new(SyncState {
                phase: Phase::Idle,
                peer: None,
                target_height: 0,
                target_work: U256::zero(),
                deadline: None,
            }),
        }
    }

    pub fn is_syncing(&self) -> bool {
        !matches!(self.state.lock().phase, Phase::Idle)
    }

    /// A peer advertised its chain state. Kick off (or retarget) a sync if
    /// it is heavier than ours.
    pub fn on_chain_state(&self, peer: PeerId, height: u64, work: U256) {
        self.p2p.note_best_height(&peer, height);
        if work <= self.chain.cumulative_difficulty() {
            return;
        }
        let mut state = self.state.lock();
        match state.phase {
            Phase::Idle => {}
            _ if work > state.target_work => {
                log::info!("heavier target from {peer}, restarting sync");
            }
            _ => return,
        }
        state.peer = Some(peer);
        state.target_height = height;
        state.target_work = work;
        let (_, our_height) = self.chain.tip();
        let probe_end = our_height.min(height);
        state.phase = Phase::Locating { probe_end };
        state.deadline = Some(Instant::now() + WINDOW_TIMEOUT);
        drop(state);

        log::info!("syncing to height {height} from {peer}");
        self.request_headers(peer, probe_end.saturating_sub(HEADER_WINDOW - 1));
    }

    fn request_headers(&self, peer: PeerId, start: u64) {
        self.p2p.send(
            &peer,
            NetMessage::HeaderHashes {
                start_height: start,
                hashes: Vec::new(),
            },
        );
    }

    /// A window of header hashes arrived.
    pub fn on_header_hashes(&self, peer: PeerId, start_height: u64, hashes: Vec<Hash32>) {
        let mut state = self.state.lock();
        if state.peer != Some(peer) {
            return;
        }
        if hashes.is_empty() {
            // The peer has nothing at this height; it lied about its chain.
            drop(state);
            self.fail_source(peer, "empty header window");
            return;
        }
        state.deadline = Some(Instant::now() + WINDOW_TIMEOUT);

        match &mut state.phase {
            Phase::Locating { probe_end } => {
                let probe_end = *probe_end;
                // Highest height in the window whose hash matches our chain.
                let mut common: Option<u64> = None;
                for (offset, hash) in hashes.iter().enumerate() {
                    let height = start_height + offset as u64;
                    if height > probe_end {
                        break;
                    }
                    match self.chain.store().header_hash_at(height) {
                        Ok(Some(ours)) if ours == *hash => common = Some(height),
                        _ => {}
                    }
                }
                match common {
                    Some(anchor) => {
                        // Everything above the anchor in this window is the
                        // peer's branch; seed the expected set with it.
                        let mut expected = BTreeMap::new();
                        for (offset, hash) in hashes.iter().enumerate() {
                            let height = start_height + offset as u64;
                            if height > anchor {
                                expected.insert(height, *hash);
                            }
                        }
                        let next_apply = anchor + 1;
                        state.phase = Phase::Fetching {
                            expected,
                            buffered: BTreeMap::new(),
                            next_apply,
                            next_request: next_apply,
                        };
                        drop(state);
                        log::info!("sync anchor at height {anchor}");
                        self.pump(peer);
                    }
                    None if start_height == 0 => {
                        drop(state);
                        self.fail_source(peer, "no common ancestor down to genesis");
                    }
                    None => {
                        // Walk further back.
                        let new_end = start_height.saturating_sub(1);
                        state.phase = Phase::Locating { probe_end: new_end };
                        drop(state);
                        self.request_headers(peer, new_end.saturating_sub(HEADER_WINDOW - 1));
                    }
                }
            }
            Phase::Fetching { expected, .. } => {
                // Forward extension of the validated window.
                for (offset, hash) in hashes.iter().enumerate() {
                    expected.insert(start_height + offset as u64, *hash);
                }
                drop(state);
                self.pump(peer);
            }
            Phase::Idle => {}
        }
    }

    /// A block fetched by height arrived.
    pub fn on_push_block(&self, peer: PeerId, block: Block) -> Result<()> {
        let mut state = self.state.lock();
        if state.peer != Some(peer) {
            return Ok(());
        }
        let Phase::Fetching {
            expected, buffered, ..
        } = &mut state.phase
        else {
            return Ok(());
        };
        let height = block.height();
        let hash = block.hash();
        match expected.get(&height) {
            Some(want) if *want == hash => {
                buffered.insert(height, block);
            }
            Some(_) => {
                drop(state);
                self.fail_source(peer, "block does not match pre-validated header");
                return Err(CoreError::ProtocolViolation(
                    "pushed block contradicts announced header".into(),
                ));
            }
            // Never requested: only a nuisance, ignore.
            None => return Ok(()),
        }
        state.deadline = Some(Instant::now() + WINDOW_TIMEOUT);
        drop(state);
        self.pump(peer);
        Ok(())
    }

    /// Drive the fetch pipeline: apply whatever is contiguous, request the
    /// next window, extend headers or finish.
    fn pump(&self, peer: PeerId) {
        // Apply contiguous buffered blocks outside the state lock.
        loop {
            let block = {
                let mut state = self.state.lock();
                let Phase::Fetching {
                    buffered,
                    next_apply,
                    expected,
                    ..
                } = &mut state.phase
                else {
                    return;
                };
                let height = *next_apply;
                match buffered.remove(&height) {
                    Some(block) => {
                        expected.remove(&height);
                        *next_apply += 1;
                        block
                    }
                    None => break,
                }
            };
            match self.chain.submit_block(block, BlockSource::Sync) {
                Ok(BlockAccept::Connected | BlockAccept::Reorged { .. } | BlockAccept::SideChain) => {}
                Ok(BlockAccept::Duplicate) => {}
                Ok(BlockAccept::Orphaned) => {
                    // Should not happen below a validated anchor.
                    self.fail_source(peer, "synced block had no parent");
                    return;
                }
                Err(err) => {
                    log::warn!("synced block rejected: {err}");
                    self.fail_source(peer, "invalid block during sync");
                    return;
                }
            }
        }

        let mut state = self.state.lock();
        let target_height = state.target_height;
        let Phase::Fetching {
            expected,
            next_apply,
            next_request,
            ..
        } = &mut state.phase
        else {
            return;
        };

        // Done?
        if *next_apply > target_height {
            log::info!("sync complete at height {}", target_height);
            state.phase = Phase::Idle;
            state.peer = None;
            state.deadline = None;
            return;
        }

        // Need more validated headers?
        let max_expected = expected.keys().next_back().copied();
        if expected.is_empty() || max_expected < Some(*next_request) {
            let from = max_expected.map(|h| h + 1).unwrap_or(*next_apply);
            drop(state);
            self.request_headers(peer, from);
            return;
        }

        // Request the next block window over heights with validated headers.
        let window_end = (*next_apply + BLOCK_WINDOW).min(target_height + 1);
        let mut requested = false;
        while *next_request < window_end {
            let height = *next_request;
            if !expected.contains_key(&height) {
                break;
            }
            self.p2p.send(&peer, NetMessage::FetchBlock { height });
            *next_request += 1;
            requested = true;
        }
        if requested {
            state.deadline = Some(Instant::now() + WINDOW_TIMEOUT);
        }
    }

    /// Periodic housekeeping: give up on a stalled source and re-select.
    pub fn on_tick(&self) {
        let stalled = {
            let state = self.state.lock();
            match (&state.phase, state.deadline) {
                (Phase::Idle, _) => None,
                (_, Some(deadline)) if Instant::now() > deadline => state.peer,
                _ => None,
            }
        };
        if let Some(peer) = stalled {
            self.fail_source(peer, "sync window timed out");
        }
    }

    /// Penalize the current source, reset, and probe the next-best peer.
    fn fail_source(&self, peer: PeerId, reason: &str) {
        log::warn!("sync source {peer} failed: {reason}");
        self.p2p.penalize(&peer, 50, reason);
        {
            let mut state = self.state.lock();
            state.phase = Phase::Idle;
            state.peer = None;
            state.deadline = None;
            state.target_work = U256::zero();
        }
        // Ask the best remaining peer for its chain state; the answer
        // re-enters through on_chain_state.
        if let Some((next, _)) = self.p2p.best_peer() {
            if next != peer {
                self.p2p.send(&next, NetMessage::Sync);
            }
        }
    }
}
