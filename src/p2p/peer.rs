//! One TCP peer session: framing, handshake, rate accounting, idle
//! deadlines.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::CoreError;
use crate::p2p::message::{NetMessage, PROTOCOL_VERSION};
use crate::p2p::{P2pService, PeerEvent};
use crate::wire::{WireDecode, WireEncode};
use crate::Result;

pub type PeerId = SocketAddr;

/// Send a flow-control ACK after this many received payload bytes.
const ACK_EVERY_BYTES: u64 = 256 * 1024;

pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, max: u32) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| CoreError::Network(format!("read: {e}")))?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(CoreError::ProtocolViolation("empty frame".into()));
    }
    if len > max {
        return Err(CoreError::ProtocolViolation(format!(
            "frame of {len} bytes exceeds limit {max}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| CoreError::Network(format!("read: {e}")))?;
    Ok(buf)
}

pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<()> {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| CoreError::Network(format!("write: {e}")))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| CoreError::Network(format!("write: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| CoreError::Network(format!("write: {e}")))?;
    Ok(())
}

async fn read_message<S: AsyncRead + Unpin>(stream: &mut S, max: u32) -> Result<(NetMessage, u64)> {
    let frame = read_frame(stream, max).await?;
    let message = NetMessage::decode(&frame)?;
    Ok((message, frame.len() as u64))
}

/// Remote identity established by the handshake.
#[derive(Debug, Clone)]
pub struct RemoteVersion {
    pub protocol_version: u32,
    pub rate_limit: u64,
    pub best_height: u64,
}

/// Exchange `VE` messages and verify we are on the same network. The
/// initiator speaks first.
async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    service: &P2pService,
    outbound: bool,
) -> Result<RemoteVersion> {
    let ours = service.version_message();
    let deadline = Duration::from_secs(service.config().handshake_timeout_secs);
    let max_frame = service.config().max_frame_bytes;

    let theirs = if outbound {
        write_frame(stream, &ours.encode()).await?;
        timeout(deadline, read_message(stream, max_frame))
            .await
            .map_err(|_| CoreError::PeerTimeout)??
            .0
    } else {
        let received = timeout(deadline, read_message(stream, max_frame))
            .await
            .map_err(|_| CoreError::PeerTimeout)??
            .0;
        write_frame(stream, &ours.encode()).await?;
        received
    };

    let NetMessage::Version {
        protocol_version,
        genesis_hash,
        rate_limit,
        best_height,
    } = theirs
    else {
        return Err(CoreError::ProtocolViolation(
            "first message was not a version".into(),
        ));
    };
    if genesis_hash != service.genesis_hash() {
        return Err(CoreError::ProtocolViolation(
            "genesis hash mismatch: peer is on another network".into(),
        ));
    }
    if protocol_version != PROTOCOL_VERSION {
        return Err(CoreError::ProtocolViolation(format!(
            "unsupported protocol version {protocol_version}"
        )));
    }
    Ok(RemoteVersion {
        protocol_version,
        rate_limit,
        best_height,
    })
}

/// Drive a peer session to completion. Returns the error that ended it, if
/// any; the caller handles table cleanup and ban policy.
pub async fn run_session(
    service: Arc<P2pService>,
    mut stream: TcpStream,
    peer: PeerId,
    outbound: bool,
) -> Result<()> {
    let remote = handshake(&mut stream, &service, outbound).await?;
    log::info!(
        "peer {peer} connected ({}, height {})",
        if outbound { "outbound" } else { "inbound" },
        remote.best_height
    );

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<NetMessage>();
    if !service.register_peer(peer, out_tx.clone(), &remote) {
        return Err(CoreError::Network("peer table full".into()));
    }
    service
        .events()
        .send(PeerEvent::Connected {
            peer,
            best_height: remote.best_height,
        })
        .await
        .map_err(|_| CoreError::Network("event channel closed".into()))?;

    let (mut read_half, mut write_half) = stream.into_split();
    let max_frame = service.config().max_frame_bytes;
    let idle = Duration::from_secs(service.config().idle_timeout_secs);

    // Writer half: drains the outbound queue.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write_frame(&mut write_half, &message.encode()).await.is_err() {
                break;
            }
        }
    });

    // Reader half: rate accounting against the limit WE advertise, periodic
    // ACKs of what we processed.
    let our_limit = service.config().peer_rate_limit;
    let mut received_total: u64 = 0;
    let mut last_acked: u64 = 0;
    let mut window_started = tokio::time::Instant::now();
    let mut window_bytes: u64 = 0;

    let result = loop {
        let (message, frame_len) = match timeout(idle, read_message(&mut read_half, max_frame)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => break Err(err),
            Err(_) => break Err(CoreError::PeerTimeout),
        };

        received_total += frame_len;
        window_bytes += frame_len;
        if window_started.elapsed() >= Duration::from_secs(1) {
            window_started = tokio::time::Instant::now();
            window_bytes = 0;
        } else if window_bytes > our_limit {
            break Err(CoreError::PeerRateExceeded);
        }
        if received_total - last_acked >= ACK_EVERY_BYTES {
            last_acked = received_total;
            let _ = out_tx.send(NetMessage::Ack {
                bytes_processed: received_total,
            });
        }

        match message {
            NetMessage::Version { .. } => {
                break Err(CoreError::ProtocolViolation("duplicate version".into()));
            }
            NetMessage::Ack { bytes_processed } => {
                service.note_ack(&peer, bytes_processed);
            }
            other => {
                if service
                    .events()
                    .send(PeerEvent::Message {
                        peer,
                        message: other,
                    })
                    .await
                    .is_err()
                {
                    break Ok(());
                }
            }
        }
    };

    writer.abort();
    result
}
