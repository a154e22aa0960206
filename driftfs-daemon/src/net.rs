//! Peer connection adapter: newline-delimited JSON envelopes over TCP.
//!
//! Each side of a fresh connection writes a single line carrying its node
//! id, then envelopes flow line by line. Because every node dials every
//! other, simultaneous connects produce two links for one pair; the
//! tie-break keeps the one initiated by the lexicographically smaller id.
//!
//! Send failures are logged and the peer presumed disconnected; the dial
//! loop reconnects on its own schedule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};

use driftfs_raft::message::Envelope;
use driftfs_raft::{NodeId, Transport};

use crate::config::NodeDescriptor;

const REDIAL_DELAY: Duration = Duration::from_secs(1);

struct Link {
    tx: UnboundedSender<Envelope>,
    initiated_by_us: bool,
}

struct NetCtx {
    id: NodeId,
    links: Mutex<HashMap<NodeId, Link>>,
    inbound: UnboundedSender<(NodeId, Envelope)>,
}

/// Keep the connection initiated by the lexicographically smaller id.
/// Returns whether a newly handshaken link should displace an existing one
/// of the opposite orientation.
fn new_link_wins(initiated_by_us: bool, our_id: &str, peer_id: &str) -> bool {
    if initiated_by_us {
        our_id < peer_id
    } else {
        peer_id < our_id
    }
}

/// The outbound half handed to the consensus controller.
#[derive(Clone)]
pub struct PeerTransport {
    ctx: Arc<NetCtx>,
}

impl Transport for PeerTransport {
    fn send(&mut self, target: &NodeId, envelope: Envelope) {
        let links = self.ctx.links.lock().expect("links lock");
        match links.get(target) {
            Some(link) => {
                if link.tx.send(envelope).is_err() {
                    tracing::info!(%target, "send failed; peer presumed disconnected");
                }
            }
            None => tracing::debug!(%target, "no connection; dropping envelope"),
        }
    }

    fn broadcast(&mut self, envelope: Envelope) {
        let links = self.ctx.links.lock().expect("links lock");
        for (target, link) in links.iter() {
            if link.tx.send(envelope.clone()).is_err() {
                tracing::info!(%target, "send failed; peer presumed disconnected");
            }
        }
    }
}

/// Start listening and dialing. Inbound envelopes land on `inbound` in
/// per-peer FIFO order.
pub async fn spawn(
    id: NodeId,
    listen_port: u16,
    peers: Vec<NodeDescriptor>,
    inbound: UnboundedSender<(NodeId, Envelope)>,
) -> anyhow::Result<PeerTransport> {
    let ctx = Arc::new(NetCtx {
        id,
        links: Mutex::new(HashMap::new()),
        inbound,
    });

    let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
    tracing::info!(port = listen_port, "listening for peers");
    let accept_ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "inbound connection");
                    tokio::spawn(run_connection(accept_ctx.clone(), stream, false, None));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(REDIAL_DELAY).await;
                }
            }
        }
    });

    for peer in peers {
        let dial_ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                if !dial_ctx
                    .links
                    .lock()
                    .expect("links lock")
                    .contains_key(&peer.id)
                {
                    match TcpStream::connect((peer.host.as_str(), peer.port)).await {
                        Ok(stream) => {
                            run_connection(dial_ctx.clone(), stream, true, Some(peer.id.clone()))
                                .await;
                        }
                        Err(err) => {
                            tracing::debug!(peer = %peer.id, error = %err, "dial failed");
                        }
                    }
                }
                tokio::time::sleep(REDIAL_DELAY).await;
            }
        });
    }

    Ok(PeerTransport { ctx })
}

/// Handshake, register, then pump lines until the peer goes away.
async fn run_connection(
    ctx: Arc<NetCtx>,
    stream: TcpStream,
    initiated_by_us: bool,
    expected: Option<NodeId>,
) {
    let (read_half, mut write_half) = stream.into_split();
    if write_half
        .write_all(format!("{}\n", ctx.id).as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let mut lines = BufReader::new(read_half).lines();
    let peer = match lines.next_line().await {
        Ok(Some(line)) => line.trim().to_owned(),
        _ => return,
    };
    if peer.is_empty() || peer == ctx.id {
        tracing::warn!(%peer, "bad handshake");
        return;
    }
    if let Some(expected) = expected {
        if expected != peer {
            tracing::warn!(%peer, %expected, "peer identified as someone else");
            return;
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    {
        let mut links = ctx.links.lock().expect("links lock");
        if links.contains_key(&peer) && !new_link_wins(initiated_by_us, &ctx.id, &peer) {
            tracing::debug!(%peer, "dropping duplicate connection");
            return;
        }
        links.insert(
            peer.clone(),
            Link {
                tx: tx.clone(),
                initiated_by_us,
            },
        );
    }
    tracing::info!(%peer, initiated_by_us, "peer connected");
    tokio::spawn(run_writer(rx, write_half, peer.clone()));

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(&line) {
                    Ok(envelope) => {
                        if ctx.inbound.send((peer.clone(), envelope)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "undecodable envelope");
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    tracing::info!(%peer, "peer disconnected");
    let mut links = ctx.links.lock().expect("links lock");
    // Only deregister the link this connection owns.
    if links
        .get(&peer)
        .is_some_and(|link| link.tx.same_channel(&tx))
    {
        links.remove(&peer);
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut write_half: OwnedWriteHalf,
    peer: NodeId,
) {
    while let Some(envelope) = rx.recv().await {
        let line = match serde_json::to_string(&envelope) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "unencodable envelope");
                continue;
            }
        };
        if write_half.write_all(format!("{line}\n").as_bytes()).await.is_err() {
            tracing::info!(%peer, "write failed; peer presumed disconnected");
            return;
        }
    }
}
