//! Client sessions
//!
//! A session is the broker side of one MQTT connection: the subscriber the
//! trie fans messages out to, plus the per-connection state the service
//! keeps (links, subscriptions, last will).

use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::broker::{SendError, SharedWriter};
use crate::event::Subscription;
use crate::id;
use crate::message::{Message, Ssid};
use crate::topic::{Subscriber, SubscriberKind};

/// Maximum number of links per connection
pub const MAX_LINKS: usize = 100;

/// Will message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: Bytes,
    pub payload: Bytes,
    pub retain: bool,
}

pub struct Session {
    luid: u64,
    /// Cluster-wide connection name
    name: String,
    client_id: String,
    username: String,
    writer: Arc<SharedWriter>,
    /// Link name -> `key/channel/`
    links: RwLock<AHashMap<String, String>>,
    subscriptions: Mutex<AHashMap<Ssid, Subscription>>,
    will: Mutex<Option<WillMessage>>,
}

impl Session {
    pub fn new(peer_id: u64, client_id: String, username: String, writer: Arc<SharedWriter>) -> Self {
        let luid = id::next();
        Self {
            luid,
            name: id::connection_name(peer_id, luid),
            client_id,
            username,
            writer,
            links: RwLock::new(AHashMap::new()),
            subscriptions: Mutex::new(AHashMap::new()),
            will: Mutex::new(None),
        }
    }

    pub fn luid(&self) -> u64 {
        self.luid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn writer(&self) -> &Arc<SharedWriter> {
        &self.writer
    }

    /// Sends a message on `channel` to this client only.
    pub fn reply(&self, channel: impl Into<Bytes>, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.writer.send_message(channel.into(), payload.into())
    }

    pub fn set_will(&self, will: Option<WillMessage>) {
        *self.will.lock() = will;
    }

    pub fn take_will(&self) -> Option<WillMessage> {
        self.will.lock().take()
    }

    pub fn has_will(&self) -> bool {
        self.will.lock().is_some()
    }

    /// Adds or replaces a link. Fails when the link table is full.
    pub fn add_link(&self, name: &str, channel: String) -> bool {
        let mut links = self.links.write();
        if links.len() >= MAX_LINKS && !links.contains_key(name) {
            return false;
        }
        links.insert(name.to_string(), channel);
        true
    }

    pub fn link(&self, name: &str) -> Option<String> {
        self.links.read().get(name).cloned()
    }

    pub fn links(&self) -> HashMap<String, String> {
        self.links
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remembers a subscription; false if the SSID was already subscribed.
    pub fn add_subscription(&self, ev: Subscription) -> bool {
        let mut subs = self.subscriptions.lock();
        if subs.contains_key(&ev.ssid) {
            return false;
        }
        subs.insert(ev.ssid.clone(), ev);
        true
    }

    pub fn remove_subscription(&self, ssid: &Ssid) -> Option<Subscription> {
        self.subscriptions.lock().remove(ssid)
    }

    pub fn has_subscription(&self, ssid: &Ssid) -> bool {
        self.subscriptions.lock().contains_key(ssid)
    }

    /// Drains every subscription, for connection close.
    pub fn take_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().drain().map(|(_, ev)| ev).collect()
    }
}

impl Subscriber for Session {
    fn id(&self) -> u64 {
        self.luid
    }

    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Direct
    }

    fn send(&self, msg: &Message) -> bool {
        match self.writer.send_message(msg.channel.clone(), msg.payload.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping message for {}: {:?}", self.client_id, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("luid", &self.luid)
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .finish()
    }
}
