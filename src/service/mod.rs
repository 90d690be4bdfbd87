//! Pub/sub service
//!
//! Sits between connections and the core: authorises channels against
//! capability keys, fans messages out through the trie, records
//! subscriptions in the replicated state and answers the in-band
//! `emitter/...` requests.

mod errors;
pub mod history;
mod keyban;
mod keygen;
mod link;
mod me;
pub mod presence;

pub use errors::Error;
pub use history::{HistoryQuery, HistorySurveyee};
pub use keyban::{KeyBanRequest, KeyBanResponse};
pub use keygen::{KeyGenRequest, KeyGenResponse};
pub use link::{LinkRequest, LinkResponse};
pub use me::MeResponse;
pub use presence::{PresenceEvent, PresenceQueue, PresenceSurveyee, Who};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cluster::{Network, Surveyor};
use crate::config::Config;
use crate::event::{Ban, Event, EventType, State, Subscription};
use crate::hash;
use crate::message::{Message, Ssid, RETAINED_TTL};
use crate::metrics::Metrics;
use crate::security::channel::normalize_subscription;
use crate::security::{perm, Channel, Cipher, Contract, ContractProvider, ContractState, Key, License};
use crate::session::Session;
use crate::storage::Storage;
use crate::topic::{Subscriber, SubscriberKey, SubscriberKind, SubscriptionTrie};

use self::presence::{Notification, PresenceNotification};

/// Key segment of in-band requests.
pub const EMITTER: &[u8] = b"emitter";

/// Channel failed requests are answered on.
pub const ERROR_CHANNEL: &str = "emitter/error/";

/// Requests only need their id to be answered.
#[derive(Deserialize, Default)]
struct RequestId {
    #[serde(default)]
    req: u16,
}

/// What the service is built from.
pub struct Dependencies {
    pub license: License,
    pub contracts: Arc<dyn ContractProvider>,
    pub trie: Arc<SubscriptionTrie>,
    pub state: Arc<State>,
    pub storage: Arc<dyn Storage>,
    pub network: Arc<dyn Network>,
    pub metrics: Arc<Metrics>,
}

pub struct Service {
    peer_id: u64,
    cipher: Cipher,
    contracts: Arc<dyn ContractProvider>,
    trie: Arc<SubscriptionTrie>,
    state: Arc<State>,
    storage: Arc<dyn Storage>,
    network: Arc<dyn Network>,
    surveyor: Arc<Surveyor>,
    presence: PresenceQueue,
    metrics: Arc<Metrics>,
    clock: Clock,
    /// Upper bound on a stored message's TTL, in seconds
    retention: u32,
    survey_timeout: Duration,
    presence_interval: Duration,
    state_gc_interval: Duration,
}

impl Service {
    pub fn new(config: &Config, deps: Dependencies) -> Arc<Self> {
        let peer_id = deps.network.peer_id();
        let surveyor = Surveyor::new(deps.network.clone(), deps.metrics.clone(), config.survey.queue_size);
        surveyor.register(Arc::new(PresenceSurveyee::new(deps.state.clone(), peer_id)));
        surveyor.register(Arc::new(HistorySurveyee::new(deps.storage.clone())));

        Arc::new(Self {
            peer_id,
            cipher: deps.license.cipher(),
            contracts: deps.contracts,
            trie: deps.trie,
            clock: deps.state.clock().clone(),
            state: deps.state,
            storage: deps.storage,
            network: deps.network,
            surveyor,
            presence: PresenceQueue::new(config.presence.queue_size),
            metrics: deps.metrics,
            retention: config.storage.retention.as_secs().clamp(1, u32::MAX as u64) as u32,
            survey_timeout: config.survey.timeout,
            presence_interval: config.presence.flush_interval,
            state_gc_interval: config.cluster.state_gc_interval,
        })
    }

    /// Spawns the surveyor, the presence notifier and the state GC.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Result<(), Error> {
        self.surveyor
            .start(&self.trie, shutdown.subscribe())
            .map_err(|_| Error::ServerError)?;

        let this = self.clone();
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.presence_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.flush_presence(),
                    _ = rx.recv() => {
                        this.flush_presence();
                        return;
                    }
                }
            }
        });

        let this = self.clone();
        let mut rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.state_gc_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = this.state.gc();
                        if removed > 0 {
                            debug!("State GC removed {} tombstones", removed);
                        }
                    }
                    _ = rx.recv() => return,
                }
            }
        });

        Ok(())
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn trie(&self) -> &Arc<SubscriptionTrie> {
        &self.trie
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Checks a channel's key: decryptable, not banned, not expired, minted
    /// for a known and allowed contract, carrying `permission` and scoped to
    /// the channel.
    pub fn authorize(&self, channel: &Channel, permission: u8) -> Result<(Arc<Contract>, Key), Error> {
        if !channel.is_valid() {
            return Err(Error::BadRequest);
        }

        let key = self
            .cipher
            .decrypt_key(&channel.key)
            .map_err(|_| Error::Unauthorized)?;
        self.check_key(&key, channel.key_str())?;
        let contract = self.contract_of(&key)?;

        if !key.has_permission(permission) || !key.validate_channel(channel) {
            return Err(Error::Unauthorized);
        }
        Ok((contract, key))
    }

    /// Ban and expiry checks.
    fn check_key(&self, key: &Key, text: &str) -> Result<(), Error> {
        if self.state.contains(&Ban(text.to_string())) {
            return Err(Error::Unauthorized);
        }
        if key.is_expired_at(self.clock.now_secs()) {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }

    fn contract_of(&self, key: &Key) -> Result<Arc<Contract>, Error> {
        let contract = self.contracts.get(key.contract()).ok_or(Error::NotFound)?;
        if !contract.validate(key) {
            return Err(Error::Unauthorized);
        }
        if contract.state() == ContractState::Refused {
            return Err(Error::PaymentRequired);
        }
        Ok(contract)
    }

    /// Delivers to every matching subscriber; returns how many took it.
    pub fn publish(&self, msg: &Message, filter: Option<&dyn Fn(&dyn Subscriber) -> bool>) -> usize {
        let ssid = msg.ssid();
        let subscribers = self.trie.lookup(&ssid, filter);
        self.deliver(msg, &ssid, subscribers.iter())
    }

    /// Messages forwarded by peers go to local subscribers only.
    pub fn on_peer_message(&self, msg: Message) {
        let ssid = msg.ssid();
        let local = |s: &dyn Subscriber| s.kind() != SubscriberKind::Remote;
        let subscribers = self.trie.lookup(&ssid, Some(&local));
        self.deliver(&msg, &ssid, subscribers.iter());
    }

    fn deliver<'a>(
        &self,
        msg: &Message,
        ssid: &Ssid,
        subscribers: impl Iterator<Item = &'a Arc<dyn Subscriber>>,
    ) -> usize {
        let contract = self.contracts.get(ssid.contract());
        let size = msg.size();
        let mut delivered = 0;
        for sub in subscribers {
            if !sub.send(msg) {
                self.metrics.publish_dropped();
                continue;
            }
            delivered += 1;
            if sub.kind() == SubscriberKind::Direct {
                self.metrics.publish_sent(size);
                if let Some(contract) = &contract {
                    contract.usage().add_egress(size);
                }
            }
        }
        delivered
    }

    /// Handles a client PUBLISH.
    pub async fn on_publish(&self, conn: &Arc<Session>, topic: &[u8], payload: Bytes, retain: bool) -> Result<(), Error> {
        let resolved = self.resolve_link(conn, topic);
        let channel = Channel::parse(resolved.as_deref().unwrap_or(topic));

        if channel.key == EMITTER {
            self.on_request(conn, &channel, payload).await;
            return Ok(());
        }

        let exclude = channel.exclude_me().then(|| conn.key());
        self.publish_channel(&channel, payload, retain, exclude).await
    }

    /// Link names stand in for whole channels.
    fn resolve_link(&self, conn: &Session, topic: &[u8]) -> Option<Vec<u8>> {
        if topic.len() > link::MAX_NAME_LEN || topic.contains(&b'/') {
            return None;
        }
        let name = std::str::from_utf8(topic).ok()?;
        conn.link(name).map(String::into_bytes)
    }

    async fn publish_channel(
        &self,
        channel: &Channel,
        payload: Bytes,
        retain: bool,
        exclude: Option<SubscriberKey>,
    ) -> Result<(), Error> {
        if !channel.is_valid() {
            return Err(Error::BadRequest);
        }
        if !channel.is_static() {
            return Err(Error::Forbidden);
        }

        let (contract, key) = self.authorize(channel, perm::WRITE)?;
        if key.has_permission(perm::EXTEND) {
            return Err(Error::Unauthorized);
        }

        let ttl = match channel.ttl() {
            Some(ttl) => ttl,
            None if retain => RETAINED_TTL,
            None => 0,
        };
        let ttl = self.storage_ttl(ttl);

        let ssid = Ssid::new(contract.id(), &channel.query);
        let msg = Message::new(&ssid, channel.channel.clone(), payload).with_ttl(ttl);
        contract.usage().add_ingress(msg.size());
        self.metrics.publish_received(msg.size());

        if msg.stored() && key.has_permission(perm::STORE) {
            match self.storage.store(&msg).await {
                Ok(()) => self.metrics.messages_stored_total.inc(),
                Err(e) => warn!("Failed to store message: {}", e),
            }
        }

        match exclude {
            Some(me) => {
                let others = move |s: &dyn Subscriber| s.key() != me;
                self.publish(&msg, Some(&others))
            }
            None => self.publish(&msg, None),
        };
        Ok(())
    }

    /// Handles one SUBSCRIBE filter.
    pub async fn on_subscribe(&self, conn: &Arc<Session>, topic: &[u8]) -> Result<(), Error> {
        let channel = Channel::parse(&normalize_subscription(topic));
        let (contract, key) = self.authorize(&channel, perm::READ)?;
        if key.has_permission(perm::EXTEND) {
            return Err(Error::Unauthorized);
        }

        let ssid = Ssid::new(contract.id(), &channel.query);
        self.subscribe(conn, &ssid, &channel.channel)?;

        if key.has_permission(perm::LOAD) {
            let (from, until) = channel.window();
            let limit = channel.last().unwrap_or(1) as usize;
            if limit > 0 {
                for msg in self.history(&ssid, from, until, limit).await {
                    conn.send(&msg);
                }
            }
        }
        Ok(())
    }

    /// Adds the connection to the trie and the replicated state.
    fn subscribe(&self, conn: &Arc<Session>, ssid: &Ssid, channel: &[u8]) -> Result<(), Error> {
        let ev = Subscription {
            peer: self.peer_id,
            conn: conn.luid(),
            user: conn.username().to_string(),
            channel: Bytes::copy_from_slice(channel),
            ssid: ssid.clone(),
        };
        if !conn.add_subscription(ev.clone()) {
            return Ok(());
        }

        let sub: Arc<dyn Subscriber> = conn.clone();
        if let Err(e) = self.trie.subscribe(ssid, sub) {
            conn.remove_subscription(ssid);
            warn!("Subscription of {} rejected: {}", conn.client_id(), e);
            return Err(Error::BadRequest);
        }

        self.state.add(&ev);
        self.network.notify_change(EventType::Subscription, ev.encode());
        self.metrics.subscription_added();
        self.notify_presence(PresenceEvent::Subscribe, conn, &ev);
        Ok(())
    }

    /// Handles one UNSUBSCRIBE filter.
    pub async fn on_unsubscribe(&self, conn: &Arc<Session>, topic: &[u8]) -> Result<(), Error> {
        let channel = Channel::parse(&normalize_subscription(topic));
        let (contract, _) = self.authorize(&channel, perm::READ)?;
        let ssid = Ssid::new(contract.id(), &channel.query);
        self.unsubscribe(conn, &ssid);
        Ok(())
    }

    fn unsubscribe(&self, conn: &Session, ssid: &Ssid) {
        if let Some(ev) = conn.remove_subscription(ssid) {
            self.drop_subscription(conn, &ev);
        }
    }

    fn drop_subscription(&self, conn: &Session, ev: &Subscription) {
        self.trie.unsubscribe(&ev.ssid, &conn.key());
        self.state.remove(ev);
        self.network.notify_change(EventType::Subscription, ev.encode());
        self.metrics.subscription_removed();
        self.notify_presence(PresenceEvent::Unsubscribe, conn, ev);
    }

    /// Publishes the connection's will, if it still has one.
    pub async fn on_last_will(&self, conn: &Arc<Session>) -> Result<(), Error> {
        let Some(will) = conn.take_will() else {
            return Ok(());
        };
        debug!("Publishing will of {}", conn.client_id());
        let channel = Channel::parse(&will.topic);
        self.publish_channel(&channel, will.payload, will.retain, None).await
    }

    /// Retained messages live for the whole retention window; any other
    /// TTL is kept as long as it fits inside it.
    fn storage_ttl(&self, ttl: u32) -> u32 {
        if ttl == RETAINED_TTL {
            self.retention
        } else {
            ttl.min(self.retention)
        }
    }

    /// Forgets everything about a closing connection.
    pub fn close(&self, conn: &Session) {
        for ev in conn.take_subscriptions() {
            self.drop_subscription(conn, &ev);
        }
    }

    /// Newest `limit` messages of `ssid` in the window from this node and
    /// its peers, oldest first.
    pub async fn history(&self, ssid: &Ssid, from: i64, until: i64, limit: usize) -> Vec<Message> {
        let local = match self.storage.query(ssid, from, until, limit).await {
            Ok(found) => found,
            Err(e) => {
                warn!("History query failed: {}", e);
                Vec::new()
            }
        };
        if self.network.num_peers() == 0 {
            return local;
        }

        let query = HistoryQuery {
            ssid: ssid.clone(),
            from,
            until,
            limit,
        };
        let replies = self
            .surveyor
            .query(history::SURVEY, query.encode())
            .gather(self.survey_timeout)
            .await;

        let mut remote = Vec::new();
        for reply in replies {
            match crate::message::Frame::decode(&reply) {
                Ok(frame) => remote.extend(frame.into_inner()),
                Err(e) => debug!("Ignoring malformed history reply: {}", e),
            }
        }
        history::merge(local, remote, limit)
    }

    fn notify_presence(&self, event: PresenceEvent, conn: &Session, ev: &Subscription) {
        if ev.ssid.is_system() {
            return;
        }
        self.presence.push(Notification {
            ssid: ev.ssid.clone(),
            body: PresenceNotification {
                time: self.clock.now_secs(),
                event,
                channel: String::from_utf8_lossy(&ev.channel).into_owned(),
                who: Who {
                    id: conn.name().to_string(),
                    username: conn.username().to_string(),
                },
            },
        });
    }

    fn flush_presence(&self) {
        for notification in self.presence.drain() {
            if let Some(msg) = notification.to_message() {
                self.publish(&msg, None);
            }
        }
    }

    /// Dispatches an `emitter/<action>/` request and answers on the same
    /// channel, or on `emitter/error/` when it fails.
    async fn on_request(&self, conn: &Arc<Session>, channel: &Channel, payload: Bytes) {
        let req = serde_json::from_slice::<RequestId>(&payload)
            .unwrap_or_default()
            .req;
        let parts = channel.parts();
        let (target, action) = match (channel.is_valid(), channel.query.as_slice(), parts.as_slice()) {
            (true, [target], [action]) => (Some(*target), *action),
            _ => (None, ""),
        };

        let result = match target {
            Some(hash::KEYGEN) => self.on_keygen(conn, &payload),
            Some(hash::PRESENCE) => self.on_presence(conn, &payload).await,
            Some(hash::KEYBAN) => self.on_keyban(&payload),
            Some(hash::LINK) => self.on_link(conn, &payload).await,
            Some(hash::ME) => self.on_me(conn, req),
            Some(_) => Err(Error::NotImplemented),
            None => Err(Error::BadRequest),
        };

        let label = if action.is_empty() { "invalid" } else { action };
        match result {
            Ok(Some(reply)) => {
                self.metrics.request(label, 200);
                let _ = conn.reply(format!("emitter/{}/", action), reply);
            }
            Ok(None) => self.metrics.request(label, 200),
            Err(e) => {
                debug!("Request {} of {} failed: {}", label, conn.client_id(), e);
                self.metrics.request(label, e.status());
                let _ = conn.reply(ERROR_CHANNEL, e.to_reply(req));
            }
        }
    }

    /// Decrypts a key given in a request body.
    fn decrypt(&self, text: &str) -> Result<Key, Error> {
        self.cipher
            .decrypt_key(text.as_bytes())
            .map_err(|_| Error::Unauthorized)
    }

    pub fn shutdown(&self) {
        info!("Service stopping, flushing presence");
        self.flush_presence();
    }
}

/// Serialises a reply body.
fn to_json<T: serde::Serialize>(value: &T) -> Result<Option<Vec<u8>>, Error> {
    serde_json::to_vec(value)
        .map(Some)
        .map_err(|_| Error::ServerError)
}
