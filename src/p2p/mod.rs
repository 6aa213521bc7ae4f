//! Peer overlay: listener, sessions, peer table, ban list, gossip dedup.
//!
//! The service owns transport only. Decoded messages are handed to the node
//! by value over the event channel; routing into the chain manager, mempool
//! and syncer happens there.

pub mod message;
pub mod peer;

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::P2pConfig;
use crate::crypto::Hash32;
use crate::error::CoreError;
use crate::p2p::message::{NetMessage, PROTOCOL_VERSION};
use crate::p2p::peer::PeerId;
use crate::wire::WireEncode;
use crate::Result;

/// Recently announced hashes remembered for gossip dedup.
const SEEN_CACHE_CAP: usize = 65_536;
/// Credibility floor; a peer scoring below this is banned.
const CREDIBILITY_BAN: i32 = -100;
/// Unacked bytes beyond which gossip to a peer is shed.
const MAX_UNACKED_BYTES: u64 = 8 * 1024 * 1024;

/// Events delivered to the node's router.
#[derive(Debug)]
pub enum PeerEvent {
    Connected { peer: PeerId, best_height: u64 },
    Message { peer: PeerId, message: NetMessage },
    Disconnected { peer: PeerId },
}

pub struct PeerHandle {
    tx: mpsc::UnboundedSender<NetMessage>,
    /// The peer's declared inbound rate limit (bytes/s).
    pub rate_limit: u64,
    pub best_height: AtomicU64,
    sent_bytes: AtomicU64,
    acked_bytes: AtomicU64,
    credibility: AtomicI32,
    pub connected_at: Instant,
}

impl PeerHandle {
    fn outstanding(&self) -> u64 {
        self.sent_bytes
            .load(Ordering::Relaxed)
            .saturating_sub(self.acked_bytes.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    /// `None` is a permanent ban (wrong network).
    until: Option<Instant>,
}

pub struct P2pService {
    config: P2pConfig,
    genesis_hash: Hash32,
    best_height: AtomicU64,
    peers: DashMap<PeerId, Arc<PeerHandle>>,
    bans: DashMap<IpAddr, BanEntry>,
    known_addrs: Mutex<HashSet<String>>,
    seen: Mutex<(HashSet<Hash32>, VecDeque<Hash32>)>,
    events_tx: mpsc::Sender<PeerEvent>,
}

impl P2pService {
    pub fn new(
        config: P2pConfig,
        genesis_hash: Hash32,
        bootstrap: &[&str],
        events_tx: mpsc::Sender<PeerEvent>,
    ) -> Arc<Self> {
        let known: HashSet<String> = bootstrap.iter().map(|s| s.to_string()).collect();
        Arc::new(Self {
            config,
            genesis_hash,
            best_height: AtomicU64::new(0),
            peers: DashMap::new(),
            bans: DashMap::new(),
            known_addrs: Mutex::new(known),
            seen: Mutex::new((HashSet::new(), VecDeque::new())),
            events_tx,
        })
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    pub fn genesis_hash(&self) -> Hash32 {
        self.genesis_hash
    }

    pub(crate) fn events(&self) -> &mpsc::Sender<PeerEvent> {
        &self.events_tx
    }

    /// Keep the height we advertise in handshakes current.
    pub fn set_best_height(&self, height: u64) {
        self.best_height.store(height, Ordering::Relaxed);
    }

    pub(crate) fn version_message(&self) -> NetMessage {
        NetMessage::Version {
            protocol_version: PROTOCOL_VERSION,
            genesis_hash: self.genesis_hash,
            rate_limit: self.config.peer_rate_limit,
            best_height: self.best_height.load(Ordering::Relaxed),
        }
    }

    /// Bind the listener and start the bootstrap loop.
    pub async fn start(self: Arc<Self>) -> Result<SocketAddr> {
        let bind = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| CoreError::Network(format!("cannot bind {bind}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| CoreError::Network(e.to_string()))?;
        log::info!("p2p listening on {local}");

        let service = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if service.is_banned(&addr.ip()) {
                            log::debug!("refusing banned peer {addr}");
                            continue;
                        }
                        if service.peers.len() >= service.config.max_peers {
                            log::debug!("peer table full, refusing {addr}");
                            continue;
                        }
                        service.clone().spawn_session(stream, addr, false);
                    }
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });

        let service = Arc::clone(&self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(service.config.bootstrap_interval_secs.max(1));
            loop {
                Arc::clone(&service).bootstrap_round().await;
                tokio::time::sleep(interval).await;
            }
        });

        Ok(local)
    }

    /// Dial known addresses until the outbound target is met.
    async fn bootstrap_round(self: Arc<Self>) {
        if self.peers.len() >= self.config.target_peers {
            return;
        }
        let candidates: Vec<String> = {
            let known = self.known_addrs.lock();
            known.iter().cloned().collect()
        };
        for addr in candidates {
            if self.peers.len() >= self.config.target_peers {
                break;
            }
            let already = addr
                .parse::<SocketAddr>()
                .map(|sock| self.peers.contains_key(&sock))
                .unwrap_or(false);
            if already {
                continue;
            }
            if let Err(err) = self.clone().dial(&addr).await {
                log::debug!("bootstrap dial {addr} failed: {err}");
            }
        }
    }

    pub async fn dial(self: Arc<Self>, addr: &str) -> Result<PeerId> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::Network(format!("connect {addr}: {e}")))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| CoreError::Network(e.to_string()))?;
        if self.is_banned(&peer.ip()) {
            return Err(CoreError::Network(format!("{peer} is banned")));
        }
        self.spawn_session(stream, peer, true);
        Ok(peer)
    }

    fn spawn_session(self: Arc<Self>, stream: TcpStream, peer: PeerId, outbound: bool) {
        tokio::spawn(async move {
            let result = peer::run_session(Arc::clone(&self), stream, peer, outbound).await;
            self.peers.remove(&peer);
            match result {
                Ok(()) => log::info!("peer {peer} disconnected"),
                Err(err) => {
                    log::info!("peer {peer} dropped: {err}");
                    if matches!(&err, CoreError::ProtocolViolation(m) if m.starts_with("genesis hash mismatch"))
                    {
                        // Wrong network: never talk to this address again.
                        self.ban(peer.ip(), None);
                    } else if err.is_bannable() {
                        self.ban(
                            peer.ip(),
                            Some(Duration::from_secs(self.config.ban_duration_secs)),
                        );
                    }
                }
            }
            let _ = self.events_tx.send(PeerEvent::Disconnected { peer }).await;
        });
    }

    pub(crate) fn register_peer(
        &self,
        peer: PeerId,
        tx: mpsc::UnboundedSender<NetMessage>,
        remote: &peer::RemoteVersion,
    ) -> bool {
        if self.peers.len() >= self.config.max_peers {
            return false;
        }
        self.peers.insert(
            peer,
            Arc::new(PeerHandle {
                tx,
                rate_limit: remote.rate_limit,
                best_height: AtomicU64::new(remote.best_height),
                sent_bytes: AtomicU64::new(0),
                acked_bytes: AtomicU64::new(0),
                credibility: AtomicI32::new(0),
                connected_at: Instant::now(),
            }),
        );
        true
    }

    pub(crate) fn note_ack(&self, peer: &PeerId, bytes_processed: u64) {
        if let Some(handle) = self.peers.get(peer) {
            handle.acked_bytes.store(bytes_processed, Ordering::Relaxed);
        }
    }

    pub fn note_best_height(&self, peer: &PeerId, height: u64) {
        if let Some(handle) = self.peers.get(peer) {
            handle.best_height.store(height, Ordering::Relaxed);
        }
    }

    /// Send a protocol response; always queued.
    pub fn send(&self, peer: &PeerId, message: NetMessage) {
        if let Some(handle) = self.peers.get(peer) {
            let bytes = message.encode().len() as u64;
            if handle.tx.send(message).is_ok() {
                handle.sent_bytes.fetch_add(bytes + 4, Ordering::Relaxed);
            }
        }
    }

    /// Send gossip; shed if the peer has fallen too far behind on ACKs.
    pub fn gossip(&self, peer: &PeerId, message: NetMessage) {
        if let Some(handle) = self.peers.get(peer) {
            let cap = MAX_UNACKED_BYTES.max(handle.rate_limit * 4);
            if handle.outstanding() > cap {
                log::debug!("shedding gossip to slow peer {peer}");
                return;
            }
            let bytes = message.encode().len() as u64;
            if handle.tx.send(message).is_ok() {
                handle.sent_bytes.fetch_add(bytes + 4, Ordering::Relaxed);
            }
        }
    }

    pub fn broadcast(&self, message: &NetMessage, except: Option<PeerId>) {
        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .map(|entry| *entry.key())
            .filter(|peer| Some(*peer) != except)
            .collect();
        for peer in targets {
            self.gossip(&peer, message.clone());
        }
    }

    /// Penalize a peer; bad enough scores earn a ban and disconnect.
    pub fn penalize(&self, peer: &PeerId, amount: i32, reason: &str) {
        let Some(handle) = self.peers.get(peer) else {
            return;
        };
        let score = handle.credibility.fetch_sub(amount, Ordering::Relaxed) - amount;
        log::debug!("peer {peer} penalized {amount} ({reason}), credibility {score}");
        if score <= CREDIBILITY_BAN {
            drop(handle);
            self.ban(
                peer.ip(),
                Some(Duration::from_secs(self.config.ban_duration_secs)),
            );
            self.disconnect(peer);
        }
    }

    pub fn disconnect(&self, peer: &PeerId) {
        // Dropping the sender closes the writer; the reader ends on its own.
        self.peers.remove(peer);
    }

    pub fn ban(&self, ip: IpAddr, duration: Option<Duration>) {
        let until = duration.map(|d| Instant::now() + d);
        self.bans.insert(ip, BanEntry { until });
        match duration {
            Some(d) => log::info!("banned {ip} for {}s", d.as_secs()),
            None => log::warn!("permanently banned {ip}"),
        }
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        match self.bans.get(ip) {
            Some(entry) => match entry.until {
                None => true,
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    drop(entry);
                    self.bans.remove(ip);
                    false
                }
            },
            None => false,
        }
    }

    /// Gossip dedup: true when the hash has not been seen recently.
    pub fn mark_seen(&self, hash: Hash32) -> bool {
        let mut seen = self.seen.lock();
        if !seen.0.insert(hash) {
            return false;
        }
        seen.1.push_back(hash);
        while seen.1.len() > SEEN_CACHE_CAP {
            if let Some(old) = seen.1.pop_front() {
                seen.0.remove(&old);
            }
        }
        true
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// The connected peer advertising the greatest height.
    pub fn best_peer(&self) -> Option<(PeerId, u64)> {
        self.peers
            .iter()
            .map(|entry| (*entry.key(), entry.best_height.load(Ordering::Relaxed)))
            .max_by_key(|(_, height)| *height)
    }

    pub fn add_known_addrs(&self, addrs: &[String]) {
        let mut known = self.known_addrs.lock();
        for addr in addrs {
            if known.len() >= 4_096 {
                break;
            }
            known.insert(addr.clone());
        }
    }

    pub fn known_addrs(&self) -> Vec<String> {
        self.known_addrs.lock().iter().cloned().collect()
    }

    pub fn persist_address_book(&self, path: &Path) -> Result<()> {
        let addrs = self.known_addrs();
        let bytes = bincode::serialize(&addrs)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load_address_book(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(path)?;
        let addrs: Vec<String> = bincode::deserialize(&bytes)?;
        self.add_known_addrs(&addrs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<P2pService> {
        let (tx, _rx) = mpsc::channel(16);
        P2pService::new(P2pConfig::default(), [7u8; 32], &[], tx)
    }

    #[test]
    fn seen_cache_dedupes_and_rotates() {
        let service = service();
        assert!(service.mark_seen([1u8; 32]));
        assert!(!service.mark_seen([1u8; 32]));
        assert!(service.mark_seen([2u8; 32]));
    }

    #[test]
    fn bans_expire_but_permanent_ones_do_not() {
        let service = service();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        service.ban(ip, Some(Duration::from_millis(1)));
        assert!(service.is_banned(&ip));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!service.is_banned(&ip));

        service.ban(ip, None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(service.is_banned(&ip));
    }

    #[test]
    fn address_book_round_trip() {
        let svc = service();
        svc.add_known_addrs(&["1.2.3.4:9567".to_string()]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        svc.persist_address_book(&path).unwrap();

        let other = service();
        other.load_address_book(&path).unwrap();
        assert!(other.known_addrs().contains(&"1.2.3.4:9567".to_string()));
    }

    #[tokio::test]
    async fn handshake_and_gossip_between_two_services() {
        let (tx_a, mut rx_a) = mpsc::channel(64);
        let (tx_b, mut rx_b) = mpsc::channel(64);
        let mut config_a = P2pConfig::default();
        config_a.listen_address = "127.0.0.1".into();
        config_a.listen_port = 0;
        let mut config_b = config_a.clone();
        config_b.listen_port = 0;

        let a = P2pService::new(config_a, [9u8; 32], &[], tx_a);
        let b = P2pService::new(config_b, [9u8; 32], &[], tx_b);
        let addr_a = a.clone().start().await.unwrap();
        b.clone().start().await.unwrap();

        b.clone().dial(&addr_a.to_string()).await.unwrap();

        // Both sides observe the connection.
        let connected_b = rx_b.recv().await.unwrap();
        assert!(matches!(connected_b, PeerEvent::Connected { .. }));
        let connected_a = rx_a.recv().await.unwrap();
        let PeerEvent::Connected { peer: a_sees_b, .. } = connected_a else {
            panic!("expected Connected, got {connected_a:?}");
        };

        // Gossip flows A -> B.
        a.send(&a_sees_b, NetMessage::Sync);
        let received = rx_b.recv().await.unwrap();
        match received {
            PeerEvent::Message { message, .. } => assert_eq!(message, NetMessage::Sync),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn genesis_mismatch_is_refused_and_banned() {
        let (tx_a, _rx_a) = mpsc::channel(64);
        let (tx_b, mut rx_b) = mpsc::channel(64);
        let mut config = P2pConfig::default();
        config.listen_address = "127.0.0.1".into();
        config.listen_port = 0;

        let a = P2pService::new(config.clone(), [1u8; 32], &[], tx_a);
        let b = P2pService::new(config, [2u8; 32], &[], tx_b);
        let addr_a = a.clone().start().await.unwrap();
        b.clone().start().await.unwrap();

        let _ = b.clone().dial(&addr_a.to_string()).await;
        // The session dies during the handshake; B sees a disconnect and
        // bans A's address permanently.
        let mut saw_disconnect = false;
        for _ in 0..4 {
            match tokio::time::timeout(Duration::from_secs(2), rx_b.recv()).await {
                Ok(Some(PeerEvent::Disconnected { .. })) => {
                    saw_disconnect = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_disconnect);
        assert!(b.is_banned(&addr_a.ip()));
        assert_eq!(b.peer_count(), 0);
    }
}
