//! vibemesh - distributed publish/subscribe broker
//!
//! MQTT 3.1.1 clients publish and subscribe on channels guarded by
//! encrypted channel keys. Nodes gossip their subscriptions as a
//! replicated LWW state and forward messages to the peers that need them.

pub mod broker;
pub mod clock;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod event;
pub mod hash;
pub mod id;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod security;
pub mod service;
pub mod session;
pub mod storage;
pub mod topic;
pub mod varint;

pub use broker::{Broker, BrokerError};
pub use cluster::{ClusterConfig, ClusterManager};
pub use config::Config;
pub use message::{Message, Ssid};
pub use metrics::Metrics;
pub use protocol::QoS;
pub use security::{Channel, Key, License};
pub use service::Service;
