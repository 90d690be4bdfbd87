//! Cluster Configuration
//!
//! Membership runs over chitchat (UDP gossip); replicated state and
//! forwarded messages travel over direct TCP peer links.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

use crate::event::lww::DEFAULT_MAX_FRAME_ENTRIES;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,

    /// Node name in the membership protocol (hostname if not set)
    pub node_id: Option<String>,

    /// Gossip (chitchat) bind address. Default: 0.0.0.0:7946
    pub gossip_addr: SocketAddr,

    /// What peers use to reach our gossip socket. Resolved from the
    /// hostname when not set.
    pub gossip_advertise_addr: Option<SocketAddr>,

    /// Peer link bind address. Default: 0.0.0.0:7947
    pub peer_addr: SocketAddr,

    pub peer_advertise_addr: Option<SocketAddr>,

    /// Seed nodes, "host:port" of their gossip socket
    pub seeds: Vec<String>,

    /// Membership gossip and replicated state delta interval
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Send the complete replicated state every N gossip intervals
    pub full_sync_every: u32,

    /// Grace period before a dead node is forgotten
    #[serde(with = "humantime_serde")]
    pub dead_node_grace_period: Duration,

    /// Cap on entries per replicated map in one gossip frame
    pub max_frame_entries: usize,

    /// Interval of the replicated state garbage collection
    #[serde(with = "humantime_serde")]
    pub state_gc_interval: Duration,

    /// Outbound queue of each peer link, in commands
    pub peer_queue_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            gossip_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            gossip_advertise_addr: None,
            peer_addr: SocketAddr::from(([0, 0, 0, 0], 7947)),
            peer_advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            full_sync_every: 30,
            dead_node_grace_period: Duration::from_secs(30),
            max_frame_entries: DEFAULT_MAX_FRAME_ENTRIES,
            state_gc_interval: Duration::from_secs(60),
            peer_queue_size: 8192,
        }
    }
}

impl ClusterConfig {
    /// Node name, falling back to the hostname
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{:x}", rand::random::<u32>()))
        })
    }

    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_gossip_advertise_addr(&self) -> SocketAddr {
        advertise(self.gossip_advertise_addr, self.gossip_addr)
    }

    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_peer_advertise_addr(&self) -> SocketAddr {
        advertise(self.peer_advertise_addr, self.peer_addr)
    }
}

fn advertise(explicit: Option<SocketAddr>, bind: SocketAddr) -> SocketAddr {
    if let Some(addr) = explicit {
        return addr;
    }
    if !bind.ip().is_unspecified() {
        return bind;
    }
    match resolve_local_ip() {
        Some(ip) => SocketAddr::new(ip, bind.port()),
        None => bind,
    }
}

/// Resolve the local machine's IP address by resolving the hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    format!("{}:0", hostname.to_string_lossy())
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert!(!config.enabled);
        assert!(config.node_id.is_none());
        assert_eq!(config.gossip_addr.port(), 7946);
        assert_eq!(config.peer_addr.port(), 7947);
        assert!(config.seeds.is_empty());
        assert_eq!(config.max_frame_entries, 100_000);
    }

    #[test]
    fn test_get_node_id() {
        let mut config = ClusterConfig::default();
        assert!(!config.get_node_id().is_empty());
        config.node_id = Some("my-node".to_string());
        assert_eq!(config.get_node_id(), "my-node");
    }

    #[test]
    fn test_advertise_prefers_explicit_then_bind() {
        let mut config = ClusterConfig::default();
        config.peer_addr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(config.get_peer_advertise_addr(), config.peer_addr);

        let explicit: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        config.peer_advertise_addr = Some(explicit);
        assert_eq!(config.get_peer_advertise_addr(), explicit);
    }
}
