//! Cluster Module
//!
//! Gossip-based horizontal clustering.
//!
//! # Architecture
//!
//! - **Membership (UDP via chitchat)**: node discovery and liveness. Every
//!   node publishes its peer id and peer link address as key/values.
//! - **Peer links (TCP)**: each node dials every other node and pushes
//!   replicated state deltas and message batches over that link.
//! - **Replicated state**: subscriptions of remote connections and key bans
//!   are LWW sets; merged deltas subscribe or unsubscribe the owning peer
//!   in the local trie.
//! - **Surveys**: request/response over pub/sub for cluster-wide presence
//!   and history.
//!
//! ```toml
//! [cluster]
//! enabled = true
//! gossip_addr = "0.0.0.0:7946"
//! peer_addr = "0.0.0.0:7947"
//! seeds = ["node1:7946", "node2:7946"]
//! ```

mod manager;
mod peer;
mod protocol;
pub mod survey;

pub use manager::ClusterManager;
pub use peer::{ClusterPeer, PeerStatus};
pub use protocol::{ClusterMessage, CLUSTER_PROTOCOL_VERSION};
pub use survey::{Surveyee, Surveyor};

pub use crate::config::ClusterConfig;

use std::fmt;
use std::sync::Arc;

use crate::event::EventType;
use crate::message::Message;

/// Handler for messages arriving from cluster peers.
pub type ClusterInboundCallback = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug)]
pub enum ClusterError {
    Io(std::io::Error),
    Encode(bincode::error::EncodeError),
    Decode(bincode::error::DecodeError),
    Timeout,
    Rejected(String),
    FrameTooLarge(usize),
    ConnectionLost,
    Membership(String),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Timeout => write!(f, "timed out"),
            Self::Rejected(msg) => write!(f, "rejected: {}", msg),
            Self::FrameTooLarge(n) => write!(f, "frame of {} bytes exceeds limit", n),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Membership(msg) => write!(f, "membership error: {}", msg),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

/// What the broker needs from its cluster.
pub trait Network: Send + Sync {
    /// This node's peer id.
    fn peer_id(&self) -> u64;

    /// Peers currently linked.
    fn num_peers(&self) -> usize;

    /// Queues a message to every linked peer.
    fn broadcast(&self, msg: &Message);

    /// Queues a message to one peer; false if unknown or full.
    fn send_to(&self, peer: u64, msg: &Message) -> bool;

    /// Records a replicated state key touched locally, for the next delta.
    fn notify_change(&self, kind: EventType, key: Vec<u8>);
}

/// A node without peers.
#[derive(Debug, Clone, Copy)]
pub struct Standalone {
    peer_id: u64,
}

impl Standalone {
    pub fn new(peer_id: u64) -> Self {
        Self { peer_id }
    }
}

impl Network for Standalone {
    fn peer_id(&self) -> u64 {
        self.peer_id
    }

    fn num_peers(&self) -> usize {
        0
    }

    fn broadcast(&self, _msg: &Message) {}

    fn send_to(&self, _peer: u64, _msg: &Message) -> bool {
        false
    }

    fn notify_change(&self, _kind: EventType, _key: Vec<u8>) {}
}
