//! Cluster Peer
//!
//! Outbound link to another node. The peer is a remote subscriber in the
//! local trie: messages for its subscriptions are queued without blocking
//! and written in batches by the link task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{read_message, write_message, ClusterMessage, CLUSTER_PROTOCOL_VERSION};
use super::ClusterError;
use crate::message::{Frame, Message, Ssid};
use crate::topic::{Subscriber, SubscriberKind};

/// Messages written in one `Messages` frame at most.
const MAX_BATCH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Backoff,
    Disconnected,
}

#[derive(Debug)]
enum Command {
    Message(Message),
    Gossip(Vec<u8>),
    Shutdown,
}

/// Identity we announce when dialing.
#[derive(Debug, Clone)]
pub(crate) struct LocalNode {
    pub peer_id: u64,
    pub peer_addr: String,
}

pub struct ClusterPeer {
    peer_id: u64,
    addr: SocketAddr,
    status: Arc<RwLock<PeerStatus>>,
    command_tx: mpsc::Sender<Command>,
    /// Remote connections subscribed per SSID
    refs: Mutex<AHashMap<Ssid, AHashSet<u64>>>,
}

impl ClusterPeer {
    /// Creates the peer and spawns its link task.
    pub(crate) fn spawn(peer_id: u64, addr: SocketAddr, local: LocalNode, queue_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let status = Arc::new(RwLock::new(PeerStatus::Connecting));

        tokio::spawn(connection_loop(peer_id, addr, local, status.clone(), rx));

        Arc::new(Self {
            peer_id,
            addr,
            status,
            command_tx: tx,
            refs: Mutex::new(AHashMap::new()),
        })
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// Queues encoded replicated state.
    pub fn send_gossip(&self, state: Vec<u8>) -> bool {
        self.command_tx.try_send(Command::Gossip(state)).is_ok()
    }

    /// Records that remote connection `conn` subscribed to `ssid`. Returns
    /// true when it is the first one, i.e. the peer must enter the trie.
    pub fn track(&self, ssid: &Ssid, conn: u64) -> bool {
        let mut refs = self.refs.lock();
        let conns = refs.entry(ssid.clone()).or_default();
        conns.insert(conn) && conns.len() == 1
    }

    /// Reverse of [`track`](Self::track). Returns true when the last
    /// connection left, i.e. the peer must leave the trie.
    pub fn untrack(&self, ssid: &Ssid, conn: u64) -> bool {
        let mut refs = self.refs.lock();
        let Some(conns) = refs.get_mut(ssid) else {
            return false;
        };
        if !conns.remove(&conn) || !conns.is_empty() {
            return false;
        }
        refs.remove(ssid);
        true
    }

    pub async fn stop(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
        info!("ClusterPeer {:016x}: Stopped", self.peer_id);
    }
}

impl Subscriber for ClusterPeer {
    fn id(&self) -> u64 {
        self.peer_id
    }

    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Remote
    }

    fn send(&self, msg: &Message) -> bool {
        match self.command_tx.try_send(Command::Message(msg.clone())) {
            Ok(()) => true,
            Err(e) => {
                debug!("ClusterPeer {:016x}: dropping message: {}", self.peer_id, e);
                false
            }
        }
    }
}

/// Dial with exponential backoff until shut down.
async fn connection_loop(
    peer_id: u64,
    addr: SocketAddr,
    local: LocalNode,
    status: Arc<RwLock<PeerStatus>>,
    mut command_rx: mpsc::Receiver<Command>,
) {
    let mut retry_interval = Duration::from_secs(1);
    let max_retry = Duration::from_secs(30);

    loop {
        *status.write() = PeerStatus::Connecting;
        debug!("ClusterPeer {:016x}: Connecting to {}", peer_id, addr);

        match connect_and_run(peer_id, addr, &local, &status, &mut command_rx).await {
            Ok(()) => {
                info!("ClusterPeer {:016x}: Disconnected gracefully", peer_id);
                *status.write() = PeerStatus::Disconnected;
                return;
            }
            Err(e) => {
                warn!("ClusterPeer {:016x}: Connection failed: {}", peer_id, e);
                *status.write() = PeerStatus::Backoff;
                tokio::time::sleep(retry_interval).await;
                retry_interval = std::cmp::min(retry_interval * 2, max_retry);
            }
        }

        if command_rx.is_closed() {
            *status.write() = PeerStatus::Disconnected;
            return;
        }
    }
}

async fn connect_and_run(
    peer_id: u64,
    addr: SocketAddr,
    local: &LocalNode,
    status: &RwLock<PeerStatus>,
    command_rx: &mut mpsc::Receiver<Command>,
) -> Result<(), ClusterError> {
    let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await??;
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(4096);

    write_message(
        &mut write_half,
        &ClusterMessage::Hello {
            peer_id: local.peer_id,
            peer_addr: local.peer_addr.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
        },
    )
    .await?;

    match tokio::time::timeout(Duration::from_secs(10), read_message(&mut read_half, &mut read_buf)).await?? {
        Some(ClusterMessage::HelloAck { peer_id: remote, version }) => {
            if version != CLUSTER_PROTOCOL_VERSION {
                return Err(ClusterError::Rejected(format!(
                    "protocol version mismatch: {} vs {}",
                    version, CLUSTER_PROTOCOL_VERSION
                )));
            }
            if remote != peer_id {
                return Err(ClusterError::Rejected(format!(
                    "expected peer {:016x}, reached {:016x}",
                    peer_id, remote
                )));
            }
        }
        Some(other) => {
            return Err(ClusterError::Rejected(format!("expected HelloAck, got {}", other.type_name())))
        }
        None => return Err(ClusterError::ConnectionLost),
    }

    *status.write() = PeerStatus::Connected;
    info!("ClusterPeer {:016x}: Connected to {}", peer_id, addr);

    let mut ping_timer = tokio::time::interval(Duration::from_secs(15));
    ping_timer.reset();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else {
                    return Ok(());
                };

                // Batch whatever messages are already queued behind this one.
                let mut batch = Frame::new();
                let mut next = Some(cmd);
                while let Some(cmd) = next.take() {
                    match cmd {
                        Command::Message(msg) => {
                            batch.push(msg);
                            if batch.len() < MAX_BATCH {
                                next = command_rx.try_recv().ok();
                            }
                        }
                        Command::Gossip(state) => {
                            flush(&mut write_half, &mut batch).await?;
                            write_message(&mut write_half, &ClusterMessage::Gossip { state }).await?;
                        }
                        Command::Shutdown => {
                            flush(&mut write_half, &mut batch).await?;
                            let _ = write_message(&mut write_half, &ClusterMessage::Goodbye).await;
                            return Ok(());
                        }
                    }
                }
                flush(&mut write_half, &mut batch).await?;
            }

            msg = read_message(&mut read_half, &mut read_buf) => {
                match msg? {
                    Some(ClusterMessage::Ping) => {
                        write_message(&mut write_half, &ClusterMessage::Pong).await?;
                    }
                    Some(ClusterMessage::Pong) => {}
                    Some(ClusterMessage::Goodbye) | None => return Err(ClusterError::ConnectionLost),
                    Some(other) => {
                        debug!("ClusterPeer {:016x}: ignoring {}", peer_id, other.type_name());
                    }
                }
            }

            _ = ping_timer.tick() => {
                write_message(&mut write_half, &ClusterMessage::Ping).await?;
            }
        }
    }
}

async fn flush<W>(writer: &mut W, batch: &mut Frame) -> Result<(), ClusterError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }
    let frame = std::mem::take(batch);
    match frame.encode() {
        Ok(bytes) => write_message(writer, &ClusterMessage::Messages { frame: bytes }).await,
        Err(e) => {
            warn!("Dropping {} messages that failed to encode: {}", frame.len(), e);
            Ok(())
        }
    }
}
