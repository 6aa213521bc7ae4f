//! CPU proof-of-work miner: worker threads over disjoint nonce strides,
//! template invalidation via the chain manager's sequence counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::block::Block;
use crate::chain::{BlockAccept, BlockSource, ChainManager};
use crate::config::MiningConfig;
use crate::crypto::Address;
use crate::difficulty;
use crate::error::CoreError;
use crate::Result;

#[derive(Debug, Default)]
struct MinerStats {
    hashes: AtomicU64,
    blocks_found: AtomicU64,
}

pub struct Miner {
    stop: Arc<AtomicBool>,
    stats: Arc<MinerStats>,
    threads: usize,
}

impl Miner {
    /// Start `config.mining_threads` workers plus a collector that submits
    /// found blocks and forwards accepted ones for broadcast. Returns `None`
    /// when mining is disabled.
    pub fn spawn(
        chain: Arc<ChainManager>,
        config: &MiningConfig,
        coinbase: Address,
        announce_tx: tokio::sync::mpsc::UnboundedSender<Block>,
    ) -> Result<Option<Miner>> {
        if config.mining_threads == 0 {
            return Ok(None);
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(MinerStats::default());
        let (found_tx, found_rx) = unbounded::<Block>();

        for worker_id in 0..config.mining_threads {
            let chain = Arc::clone(&chain);
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            let found_tx = found_tx.clone();
            let stride = config.mining_threads as u64;
            let check_interval = config.template_check_interval;
            thread::Builder::new()
                .name(format!("miner-{worker_id}"))
                .spawn(move || {
                    mining_loop(
                        chain,
                        coinbase,
                        worker_id as u64,
                        stride,
                        check_interval,
                        stop,
                        stats,
                        found_tx,
                    )
                })
                .map_err(|e| CoreError::Io(e.to_string()))?;
        }

        {
            let chain = Arc::clone(&chain);
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("miner-collector".into())
                .spawn(move || collector_loop(chain, found_rx, announce_tx, stop, stats))
                .map_err(|e| CoreError::Io(e.to_string()))?;
        }

        {
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("miner-status".into())
                .spawn(move || status_loop(stop, stats))
                .map_err(|e| CoreError::Io(e.to_string()))?;
        }

        log::info!(
            "miner started: {} threads, coinbase {coinbase}",
            config.mining_threads
        );
        Ok(Some(Miner {
            stop,
            stats,
            threads: config.mining_threads,
        }))
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        log::info!("miner stopped after {} hashes", self.stats.hashes.load(Ordering::Relaxed));
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn hashes_attempted(&self) -> u64 {
        self.stats.hashes.load(Ordering::Relaxed)
    }

    pub fn blocks_found(&self) -> u64 {
        self.stats.blocks_found.load(Ordering::Relaxed)
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[allow(clippy::too_many_arguments)]
fn mining_loop(
    chain: Arc<ChainManager>,
    coinbase: Address,
    worker_id: u64,
    stride: u64,
    check_interval: u64,
    stop: Arc<AtomicBool>,
    stats: Arc<MinerStats>,
    found_tx: Sender<Block>,
) {
    let mut rng = SmallRng::from_entropy();

    while !stop.load(Ordering::Relaxed) {
        let template = match chain.template(coinbase) {
            Ok(template) => template,
            Err(err) => {
                log::warn!("template unavailable: {err}");
                thread::sleep(Duration::from_millis(250));
                continue;
            }
        };
        let mut block = template.block;
        let bits = block.header.difficulty_bits;
        // Each worker owns a nonce stride; the extra nonce decorrelates
        // template restarts.
        block.header.mining_nonce = worker_id;
        block.header.extra_nonce = rng.gen();

        let mut local_hashes: u64 = 0;
        loop {
            if stop.load(Ordering::Relaxed) {
                stats.hashes.fetch_add(local_hashes, Ordering::Relaxed);
                return;
            }
            match difficulty::meets_target(&block.hash(), bits) {
                Ok(true) => {
                    stats.hashes.fetch_add(local_hashes + 1, Ordering::Relaxed);
                    if found_tx.send(block).is_err() {
                        return;
                    }
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    log::error!("bad template bits: {err}");
                    break;
                }
            }
            block.header.mining_nonce = block.header.mining_nonce.wrapping_add(stride);
            local_hashes += 1;
            if local_hashes % check_interval == 0 {
                stats.hashes.fetch_add(check_interval, Ordering::Relaxed);
                local_hashes = 0;
                if chain.template_seq() != template.seq {
                    // Tip moved; this template is stale.
                    break;
                }
            }
        }
    }
}

fn collector_loop(
    chain: Arc<ChainManager>,
    found_rx: Receiver<Block>,
    announce_tx: tokio::sync::mpsc::UnboundedSender<Block>,
    stop: Arc<AtomicBool>,
    stats: Arc<MinerStats>,
) {
    while let Ok(block) = found_rx.recv() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let height = block.height();
        match chain.submit_block(block.clone(), BlockSource::Mined) {
            Ok(BlockAccept::Connected) | Ok(BlockAccept::Reorged { .. }) => {
                stats.blocks_found.fetch_add(1, Ordering::Relaxed);
                log::info!("mined block {height}: {}", hex::encode(block.hash()));
                let _ = announce_tx.send(block);
            }
            Ok(BlockAccept::Duplicate) | Ok(BlockAccept::SideChain) => {
                log::debug!("mined block {height} arrived late");
            }
            Ok(BlockAccept::Orphaned) => {
                log::warn!("mined block {height} was orphaned");
            }
            Err(err) => {
                log::warn!("mined block {height} rejected: {err}");
            }
        }
    }
}

fn status_loop(stop: Arc<AtomicBool>, stats: Arc<MinerStats>) {
    let mut last: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(30));
        let total = stats.hashes.load(Ordering::Relaxed);
        let rate = (total - last) / 30;
        if total > 0 {
            log::info!(
                "mining: ~{rate} H/s, {total} hashes, {} blocks found",
                stats.blocks_found.load(Ordering::Relaxed)
            );
        }
        last = total;
    }
}
