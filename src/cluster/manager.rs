//! Cluster Manager
//!
//! Coordinates chitchat membership, peer links and replication of the
//! LWW state between nodes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::peer::{ClusterPeer, LocalNode, PeerStatus};
use super::protocol::{read_message, write_message, ClusterMessage, CLUSTER_PROTOCOL_VERSION};
use super::{ClusterConfig, ClusterError, ClusterInboundCallback, Network};
use crate::event::{Event, EventType, State, Subscription};
use crate::message::{Frame, Message};
use crate::metrics::Metrics;
use crate::topic::{Subscriber, SubscriberKind, SubscriptionTrie};

/// Chitchat state keys
const KEY_PEER_ADDR: &str = "peer_addr";
const KEY_PEER_ID: &str = "peer_id";

/// Shared between the manager and its background tasks.
struct Shared {
    peer_id: u64,
    local: LocalNode,
    config: ClusterConfig,
    peers: DashMap<u64, Arc<ClusterPeer>>,
    state: Arc<State>,
    trie: Arc<SubscriptionTrie>,
    metrics: Arc<Metrics>,
    dirty: Mutex<Vec<(EventType, Vec<u8>)>>,
}

pub struct ClusterManager {
    node_id: String,
    shared: Arc<Shared>,
    chitchat: ChitchatHandle,
}

impl ClusterManager {
    pub async fn new(
        config: ClusterConfig,
        peer_id: u64,
        state: Arc<State>,
        trie: Arc<SubscriptionTrie>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ClusterError> {
        let node_id = config.get_node_id();
        let gossip_advertise_addr = config.get_gossip_advertise_addr();
        let peer_advertise_addr = config.get_peer_advertise_addr();

        info!(
            "Starting cluster node: {} peer={:016x} (gossip_advertise={}, peer_advertise={})",
            node_id, peer_id, gossip_advertise_addr, peer_advertise_addr
        );

        let chitchat_id = ChitchatId::new(node_id.clone(), 0, gossip_advertise_addr);

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval,
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: "vibemesh".to_string(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![
            (KEY_PEER_ADDR.to_string(), peer_advertise_addr.to_string()),
            (KEY_PEER_ID.to_string(), peer_id.to_string()),
        ];

        let chitchat = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| ClusterError::Membership(e.to_string()))?;

        Ok(Self {
            node_id,
            shared: Arc::new(Shared {
                peer_id,
                local: LocalNode {
                    peer_id,
                    peer_addr: peer_advertise_addr.to_string(),
                },
                config,
                peers: DashMap::new(),
                state,
                trie,
                metrics,
                dirty: Mutex::new(Vec::new()),
            }),
            chitchat,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Peers known through membership or inbound links.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    /// Binds the peer listener and spawns the background loops.
    pub async fn start(
        &self,
        inbound: ClusterInboundCallback,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<(), ClusterError> {
        let listener = TcpListener::bind(self.shared.config.peer_addr).await?;
        info!(
            "Cluster manager listening on gossip={}, peer={}",
            self.shared.config.gossip_addr, self.shared.config.peer_addr
        );

        tokio::spawn(peer_listener_loop(
            listener,
            self.shared.clone(),
            inbound,
            shutdown.subscribe(),
        ));
        tokio::spawn(membership_loop(
            self.chitchat.chitchat(),
            self.shared.clone(),
            shutdown.subscribe(),
        ));
        tokio::spawn(gossip_loop(self.shared.clone(), shutdown.subscribe()));
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping cluster manager");
        let peers: Vec<_> = self.shared.peers.iter().map(|p| p.value().clone()).collect();
        for peer in peers {
            peer.stop().await;
        }
    }
}

impl Network for ClusterManager {
    fn peer_id(&self) -> u64 {
        self.shared.peer_id
    }

    fn num_peers(&self) -> usize {
        self.shared
            .peers
            .iter()
            .filter(|p| p.value().status() == PeerStatus::Connected)
            .count()
    }

    fn broadcast(&self, msg: &Message) {
        for peer in self.shared.peers.iter() {
            if peer.value().send(msg) {
                self.shared.metrics.cluster_messages_forwarded.inc();
            }
        }
    }

    fn send_to(&self, peer: u64, msg: &Message) -> bool {
        let sent = self
            .shared
            .peers
            .get(&peer)
            .is_some_and(|p| p.value().send(msg));
        if sent {
            self.shared.metrics.cluster_messages_forwarded.inc();
        }
        sent
    }

    fn notify_change(&self, kind: EventType, key: Vec<u8>) {
        self.shared.dirty.lock().push((kind, key));
    }
}

impl Shared {
    /// Creates the link to `peer_id` unless it exists. A new peer receives
    /// the full state and gets the subscriptions we already replicated for
    /// it.
    fn ensure_peer(&self, peer_id: u64, addr: SocketAddr) {
        if peer_id == self.peer_id {
            return;
        }

        let peer = match self.peers.entry(peer_id) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let peer = ClusterPeer::spawn(peer_id, addr, self.local.clone(), self.config.peer_queue_size);
                slot.insert(peer.clone());
                peer
            }
        };
        info!("Discovered cluster peer {:016x} at {}", peer_id, addr);
        self.metrics.cluster_peers_current.set(self.peers.len() as i64);

        peer.send_gossip(self.state.encode());
        self.state.subscriptions_of(peer_id, |ev| {
            self.subscribe_remote(&peer, ev);
        });
    }

    /// Drops a departed peer along with everything it subscribed to.
    async fn remove_peer(&self, peer_id: u64) {
        let Some((_, peer)) = self.peers.remove(&peer_id) else {
            return;
        };
        info!("Cluster peer {:016x} left the cluster", peer_id);
        self.metrics.cluster_peers_current.set(self.peers.len() as i64);
        peer.stop().await;

        let key = (SubscriberKind::Remote, peer_id);
        let mut dirty = Vec::new();
        self.state.subscriptions_of(peer_id, |ev| {
            self.state.remove(ev);
            self.trie.unsubscribe(&ev.ssid, &key);
            dirty.push((EventType::Subscription, ev.encode()));
        });
        self.dirty.lock().extend(dirty);
    }

    fn subscribe_remote(&self, peer: &Arc<ClusterPeer>, ev: &Subscription) {
        if peer.track(&ev.ssid, ev.conn) {
            let sub: Arc<dyn Subscriber> = peer.clone();
            if let Err(e) = self.trie.subscribe(&ev.ssid, sub) {
                debug!("Ignoring remote subscription: {}", e);
            }
        }
    }

    fn unsubscribe_remote(&self, peer: &Arc<ClusterPeer>, ev: &Subscription) {
        if peer.untrack(&ev.ssid, ev.conn) {
            self.trie.unsubscribe(&ev.ssid, &(SubscriberKind::Remote, peer.peer_id()));
        }
    }

    /// Merges a received state frame, mirrors the delta into the trie and
    /// passes it on.
    fn on_gossip(&self, from: u64, data: &[u8]) {
        let remote = match State::decode(data, self.state.clock().clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Undecodable gossip from {:016x}: {}", from, e);
                return;
            }
        };
        let Some(delta) = self.state.merge(remote) else {
            return;
        };

        // The delta only carries the newer half of each entry; the merged
        // local state decides whether the subscription stands.
        delta.subscriptions(|ev, _| {
            if ev.peer == self.peer_id {
                return;
            }
            let Some(peer) = self.peers.get(&ev.peer).map(|p| p.value().clone()) else {
                return;
            };
            if self.state.contains(ev) {
                self.subscribe_remote(&peer, ev);
            } else {
                self.unsubscribe_remote(&peer, ev);
            }
        });

        let encoded = delta.encode();
        for peer in self.peers.iter() {
            if *peer.key() != from {
                peer.value().send_gossip(encoded.clone());
            }
        }
    }
}

async fn peer_listener_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    inbound: ClusterInboundCallback,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Incoming cluster peer connection from {}", addr);
                    let shared = shared.clone();
                    let inbound = inbound.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_incoming_peer(stream, shared, inbound).await {
                            debug!("Incoming peer connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept peer connection: {}", e),
            },
            _ = shutdown.recv() => return,
        }
    }
}

async fn handle_incoming_peer(
    stream: TcpStream,
    shared: Arc<Shared>,
    inbound: ClusterInboundCallback,
) -> Result<(), ClusterError> {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = BytesMut::with_capacity(64 * 1024);

    let hello = tokio::time::timeout(Duration::from_secs(10), read_message(&mut read_half, &mut buf)).await??;
    let (peer_id, peer_addr) = match hello {
        Some(ClusterMessage::Hello {
            peer_id,
            peer_addr,
            version,
        }) => {
            if version != CLUSTER_PROTOCOL_VERSION {
                return Err(ClusterError::Rejected(format!(
                    "protocol version mismatch: {} vs {}",
                    version, CLUSTER_PROTOCOL_VERSION
                )));
            }
            (peer_id, peer_addr)
        }
        Some(other) => {
            return Err(ClusterError::Rejected(format!("expected Hello, got {}", other.type_name())))
        }
        None => return Err(ClusterError::ConnectionLost),
    };

    write_message(
        &mut write_half,
        &ClusterMessage::HelloAck {
            peer_id: shared.peer_id,
            version: CLUSTER_PROTOCOL_VERSION,
        },
    )
    .await?;
    info!("Incoming cluster peer {:016x} from {}", peer_id, peer_addr);

    match peer_addr.parse::<SocketAddr>() {
        Ok(addr) => shared.ensure_peer(peer_id, addr),
        Err(e) => warn!("Peer {:016x} announced a bad address {}: {}", peer_id, peer_addr, e),
    }

    loop {
        let Some(msg) = read_message(&mut read_half, &mut buf).await? else {
            info!("Cluster peer {:016x} disconnected", peer_id);
            return Ok(());
        };
        match msg {
            ClusterMessage::Gossip { state } => shared.on_gossip(peer_id, &state),
            ClusterMessage::Messages { frame } => match Frame::decode(&frame) {
                Ok(frame) => {
                    for msg in frame.into_inner() {
                        shared.metrics.cluster_messages_received.inc();
                        inbound(msg);
                    }
                }
                Err(e) => warn!("Undecodable message frame from {:016x}: {}", peer_id, e),
            },
            ClusterMessage::Ping => write_message(&mut write_half, &ClusterMessage::Pong).await?,
            ClusterMessage::Goodbye => {
                info!("Cluster peer {:016x} said goodbye", peer_id);
                return Ok(());
            }
            other => debug!("Ignoring {} from {:016x}", other.type_name(), peer_id),
        }
    }
}

/// Watches membership: links new nodes, drops departed ones.
async fn membership_loop(
    chitchat: Arc<tokio::sync::Mutex<chitchat::Chitchat>>,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    // node name -> peer id
    let mut known: HashMap<String, u64> = HashMap::new();
    let mut ticker = tokio::time::interval(shared.config.gossip_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => return,
        }

        let cluster_state = {
            let cc = chitchat.lock().await;
            cc.state_snapshot()
        };

        let mut current = HashMap::new();
        for node_state in &cluster_state.node_states {
            let name = node_state.chitchat_id().node_id.clone();
            let peer_id = node_state.get(KEY_PEER_ID).and_then(|v| v.parse::<u64>().ok());
            let addr = node_state
                .get(KEY_PEER_ADDR)
                .and_then(|v| v.parse::<SocketAddr>().ok());
            let (Some(peer_id), Some(addr)) = (peer_id, addr) else {
                continue;
            };
            if peer_id == shared.peer_id {
                continue;
            }
            shared.ensure_peer(peer_id, addr);
            current.insert(name, peer_id);
        }

        let departed: Vec<u64> = known
            .iter()
            .filter(|(name, _)| !current.contains_key(*name))
            .map(|(_, id)| *id)
            .collect();
        for peer_id in departed {
            shared.remove_peer(peer_id).await;
        }
        known = current;
    }
}

/// Sends locally touched state keys every gossip interval and the whole
/// state every `full_sync_every` intervals.
async fn gossip_loop(shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(shared.config.gossip_interval);
    let full_every = shared.config.full_sync_every.max(1);
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => return,
        }
        ticks = ticks.wrapping_add(1);

        let keys = std::mem::take(&mut *shared.dirty.lock());
        let encoded = if ticks % full_every == 0 {
            shared.state.encode()
        } else if keys.is_empty() {
            continue;
        } else {
            shared.state.select(&keys).encode()
        };

        for peer in shared.peers.iter() {
            if !peer.value().send_gossip(encoded.clone()) {
                debug!("Gossip queue of {:016x} is full", peer.key());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::message::Ssid;

    fn shared(peer_id: u64) -> Shared {
        Shared {
            peer_id,
            local: LocalNode {
                peer_id,
                peer_addr: "127.0.0.1:1".to_string(),
            },
            config: ClusterConfig::default(),
            peers: DashMap::new(),
            state: Arc::new(State::new(Clock::default())),
            trie: Arc::new(SubscriptionTrie::default()),
            metrics: Arc::new(Metrics::new().unwrap()),
            dirty: Mutex::new(Vec::new()),
        }
    }

    fn sub(peer: u64, conn: u64, ssid: &[u32]) -> Subscription {
        Subscription {
            peer,
            conn,
            user: String::new(),
            channel: bytes::Bytes::from_static(b"a/b/"),
            ssid: Ssid::from_slice(ssid),
        }
    }

    fn unreachable() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_gossip_subscribes_remote_peer() {
        let node = shared(1);
        node.ensure_peer(2, unreachable());

        let remote = State::new(Clock::default());
        remote.add(&sub(2, 7, &[5, 6]));
        node.on_gossip(2, &remote.encode());

        assert!(node.state.contains(&sub(2, 7, &[5, 6])));
        assert!(node.trie.contains(&[5, 6], &(SubscriberKind::Remote, 2)));
    }

    #[tokio::test]
    async fn test_gossip_ignores_own_subscriptions() {
        let node = shared(1);
        node.ensure_peer(2, unreachable());

        let remote = State::new(Clock::default());
        remote.add(&sub(1, 7, &[5, 6]));
        node.on_gossip(2, &remote.encode());

        assert_eq!(node.trie.count(), 0);
    }

    #[tokio::test]
    async fn test_remote_unsubscribe_waits_for_last_connection() {
        let node = shared(1);
        node.ensure_peer(2, unreachable());

        let clock = Clock::manual(1_000_000_000);
        let remote = State::new(clock.clone());
        remote.add(&sub(2, 7, &[5]));
        remote.add(&sub(2, 8, &[5]));
        node.on_gossip(2, &remote.encode());

        clock.advance(Duration::from_secs(1));
        remote.remove(&sub(2, 7, &[5]));
        node.on_gossip(2, &remote.select(&[(EventType::Subscription, sub(2, 7, &[5]).encode())]).encode());
        assert!(node.trie.contains(&[5], &(SubscriberKind::Remote, 2)));

        remote.remove(&sub(2, 8, &[5]));
        node.on_gossip(2, &remote.select(&[(EventType::Subscription, sub(2, 8, &[5]).encode())]).encode());
        assert!(!node.trie.contains(&[5], &(SubscriberKind::Remote, 2)));
    }

    #[tokio::test]
    async fn test_remove_peer_cleans_up() {
        let node = shared(1);
        node.ensure_peer(2, unreachable());

        let remote = State::new(Clock::default());
        remote.add(&sub(2, 7, &[5, 6]));
        node.on_gossip(2, &remote.encode());

        node.remove_peer(2).await;

        assert!(node.peers.is_empty());
        assert!(!node.state.contains(&sub(2, 7, &[5, 6])));
        assert!(!node.trie.contains(&[5, 6], &(SubscriberKind::Remote, 2)));
        assert_eq!(node.dirty.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_peer_skips_self_and_duplicates() {
        let node = shared(1);
        node.ensure_peer(1, unreachable());
        assert!(node.peers.is_empty());

        node.ensure_peer(2, unreachable());
        node.ensure_peer(2, unreachable());
        assert_eq!(node.peers.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_discovery_creates_one_link() {
        let node = Arc::new(shared(1));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let node = node.clone();
                tokio::spawn(async move { node.ensure_peer(2, unreachable()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(node.peers.len(), 1);
        assert_eq!(node.metrics.cluster_peers_current.get(), 1);
    }

    #[tokio::test]
    async fn test_new_peer_replays_known_subscriptions() {
        let node = shared(1);
        node.state.add(&sub(3, 9, &[4]));

        node.ensure_peer(3, unreachable());
        assert!(node.trie.contains(&[4], &(SubscriberKind::Remote, 3)));
    }
}
