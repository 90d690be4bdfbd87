//! Cluster surveys
//!
//! A survey is a request published under `[0, QUERY, R]` to every peer,
//! answered by the first [`Surveyee`] on each peer that knows the survey
//! type. Replies come back on the same SSID with channel `response` and
//! are collected until every linked peer answered or the deadline passed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::Network;
use crate::hash;
use crate::id;
use crate::message::{Message, Ssid};
use crate::metrics::Metrics;
use crate::topic::{Subscriber, SubscriberKind, SubscriptionTrie, TrieError};

const RESPONSE: &str = "response";

/// Answers one kind of survey on this node.
#[async_trait]
pub trait Surveyee: Send + Sync {
    /// Reply to a survey of `kind`, or `None` if not ours.
    async fn on_survey(&self, kind: &str, payload: &[u8]) -> Option<Vec<u8>>;
}

type Awaiters = DashMap<u32, mpsc::Sender<Bytes>>;

pub struct Surveyor {
    luid: u64,
    network: Arc<dyn Network>,
    metrics: Arc<Metrics>,
    next_request: AtomicU32,
    awaiters: Arc<Awaiters>,
    surveyees: RwLock<Vec<Arc<dyn Surveyee>>>,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl Surveyor {
    pub fn new(network: Arc<dyn Network>, metrics: Arc<Metrics>, queue_size: usize) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(queue_size.max(1));
        Arc::new(Self {
            luid: id::next(),
            network,
            metrics,
            next_request: AtomicU32::new(1),
            awaiters: Arc::new(DashMap::new()),
            surveyees: RwLock::new(Vec::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        })
    }

    pub fn register(&self, surveyee: Arc<dyn Surveyee>) {
        self.surveyees.write().push(surveyee);
    }

    /// Subscribes to survey traffic and spawns the dispatcher. Calling it
    /// twice does nothing the second time.
    pub fn start(self: &Arc<Self>, trie: &SubscriptionTrie, mut shutdown: broadcast::Receiver<()>) -> Result<(), TrieError> {
        let Some(mut inbox) = self.inbox_rx.lock().take() else {
            return Ok(());
        };
        let sub: Arc<dyn Subscriber> = self.clone();
        trie.subscribe_subtree(&[0, hash::QUERY], sub)?;

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = inbox.recv() => match msg {
                        Some(msg) => this.on_message(msg),
                        None => return,
                    },
                    _ = shutdown.recv() => return,
                }
            }
        });
        Ok(())
    }

    /// Publishes a survey to every peer and returns the handle that
    /// collects the replies.
    pub fn query(&self, kind: &str, payload: impl Into<Bytes>) -> Awaiter {
        let expected = self.network.num_peers();
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(expected.max(1));
        self.awaiters.insert(request, tx);
        self.metrics.surveys_total.inc();

        if expected > 0 {
            let channel = format!("{}/{}", kind, self.network.peer_id());
            let msg = Message::new(&Ssid::query(request), channel, payload);
            self.network.broadcast(&msg);
        }

        Awaiter {
            request,
            expected,
            rx,
            awaiters: self.awaiters.clone(),
        }
    }

    /// Routes a response to its awaiter; queries are answered on their
    /// own task so a slow surveyee holds up only its own survey.
    fn on_message(self: &Arc<Self>, msg: Message) {
        let ssid = msg.ssid();
        let Some(&request) = ssid.get(2) else {
            return;
        };

        if msg.channel.as_ref() == RESPONSE.as_bytes() {
            if let Some(tx) = self.awaiters.get(&request) {
                if tx.try_send(msg.payload.clone()).is_err() {
                    debug!("Dropping late survey response for {}", request);
                }
            }
            return;
        }

        let Some((kind, peer)) = parse_query_channel(&msg.channel) else {
            warn!("Malformed survey channel {:?}", msg.channel);
            return;
        };
        if peer == self.network.peer_id() {
            return;
        }

        let kind = kind.to_string();
        let this = self.clone();
        tokio::spawn(async move { this.answer(request, &kind, peer, &msg.payload).await });
    }

    async fn answer(&self, request: u32, kind: &str, peer: u64, payload: &[u8]) {
        let surveyees = self.surveyees.read().clone();
        for surveyee in surveyees {
            if let Some(reply) = surveyee.on_survey(kind, payload).await {
                let response = Message::new(&Ssid::query(request), RESPONSE, reply);
                if !self.network.send_to(peer, &response) {
                    debug!("Could not answer survey {} of {:016x}", request, peer);
                }
                return;
            }
        }
    }
}

impl Subscriber for Surveyor {
    fn id(&self) -> u64 {
        self.luid
    }

    fn kind(&self) -> SubscriberKind {
        SubscriberKind::System
    }

    fn send(&self, msg: &Message) -> bool {
        match self.inbox_tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Surveyor inbox full, dropping message");
                false
            }
        }
    }
}

/// `{kind}/{peer}`
fn parse_query_channel(channel: &[u8]) -> Option<(&str, u64)> {
    let channel = std::str::from_utf8(channel).ok()?;
    let (kind, peer) = channel.rsplit_once('/')?;
    Some((kind, peer.parse().ok()?))
}

/// Pending survey. Dropping it stops accepting replies.
pub struct Awaiter {
    request: u32,
    expected: usize,
    rx: mpsc::Receiver<Bytes>,
    awaiters: Arc<Awaiters>,
}

impl Awaiter {
    pub fn request(&self) -> u32 {
        self.request
    }

    /// Replies received before every peer answered or `timeout` elapsed.
    pub async fn gather(mut self, timeout: Duration) -> Vec<Bytes> {
        let mut replies = Vec::with_capacity(self.expected);
        if self.expected == 0 {
            return replies;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while replies.len() < self.expected {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(reply)) => replies.push(reply),
                Ok(None) | Err(_) => break,
            }
        }
        replies
    }
}

impl Drop for Awaiter {
    fn drop(&mut self) {
        self.awaiters.remove(&self.request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    /// Delivers everything to one other surveyor.
    struct Wire {
        peer_id: u64,
        peers: usize,
        other: Mutex<Option<Arc<Surveyor>>>,
    }

    impl Network for Wire {
        fn peer_id(&self) -> u64 {
            self.peer_id
        }

        fn num_peers(&self) -> usize {
            self.peers
        }

        fn broadcast(&self, msg: &Message) {
            if let Some(other) = self.other.lock().as_ref() {
                other.send(msg);
            }
        }

        fn send_to(&self, _peer: u64, msg: &Message) -> bool {
            self.other.lock().as_ref().is_some_and(|o| o.send(msg))
        }

        fn notify_change(&self, _kind: EventType, _key: Vec<u8>) {}
    }

    struct Echo;

    #[async_trait]
    impl Surveyee for Echo {
        async fn on_survey(&self, kind: &str, payload: &[u8]) -> Option<Vec<u8>> {
            (kind == "echo").then(|| payload.to_vec())
        }
    }

    /// Never answers within a test's lifetime.
    struct Stall;

    #[async_trait]
    impl Surveyee for Stall {
        async fn on_survey(&self, kind: &str, _payload: &[u8]) -> Option<Vec<u8>> {
            if kind != "stall" {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Some(Vec::new())
        }
    }

    fn node(peer_id: u64, peers: usize) -> (Arc<Wire>, Arc<Surveyor>) {
        let wire = Arc::new(Wire {
            peer_id,
            peers,
            other: Mutex::new(None),
        });
        let metrics = Arc::new(Metrics::new().unwrap());
        let surveyor = Surveyor::new(wire.clone(), metrics, 16);
        (wire, surveyor)
    }

    #[tokio::test]
    async fn test_gather_without_peers_returns_immediately() {
        let (_wire, surveyor) = node(1, 0);
        let replies = tokio::time::timeout(
            Duration::from_millis(100),
            surveyor.query("echo", "x").gather(Duration::from_secs(60)),
        )
        .await
        .unwrap();
        assert!(replies.is_empty());
        assert!(surveyor.awaiters.is_empty());
    }

    #[tokio::test]
    async fn test_survey_between_two_nodes() {
        let (shutdown, _) = broadcast::channel(1);
        let (wire_a, a) = node(1, 1);
        let (wire_b, b) = node(2, 1);
        *wire_a.other.lock() = Some(b.clone());
        *wire_b.other.lock() = Some(a.clone());
        b.register(Arc::new(Echo));

        let trie_a = SubscriptionTrie::default();
        let trie_b = SubscriptionTrie::default();
        a.start(&trie_a, shutdown.subscribe()).unwrap();
        b.start(&trie_b, shutdown.subscribe()).unwrap();

        let replies = a.query("echo", "hello").gather(Duration::from_secs(5)).await;
        assert_eq!(replies, vec![Bytes::from_static(b"hello")]);
        assert!(a.awaiters.is_empty());
    }

    #[tokio::test]
    async fn test_slow_surveyee_does_not_block_others() {
        let (shutdown, _) = broadcast::channel(1);
        let (wire_a, a) = node(1, 1);
        let (wire_b, b) = node(2, 1);
        *wire_a.other.lock() = Some(b.clone());
        *wire_b.other.lock() = Some(a.clone());
        b.register(Arc::new(Stall));
        b.register(Arc::new(Echo));

        let trie_a = SubscriptionTrie::default();
        let trie_b = SubscriptionTrie::default();
        a.start(&trie_a, shutdown.subscribe()).unwrap();
        b.start(&trie_b, shutdown.subscribe()).unwrap();

        let _stalled = a.query("stall", "x");
        let replies = a.query("echo", "hello").gather(Duration::from_secs(5)).await;
        assert_eq!(replies, vec![Bytes::from_static(b"hello")]);
    }

    #[tokio::test]
    async fn test_unknown_survey_times_out() {
        let (shutdown, _) = broadcast::channel(1);
        let (wire_a, a) = node(1, 1);
        let (wire_b, b) = node(2, 1);
        *wire_a.other.lock() = Some(b.clone());
        *wire_b.other.lock() = Some(a.clone());
        b.register(Arc::new(Echo));

        let trie = SubscriptionTrie::default();
        b.start(&trie, shutdown.subscribe()).unwrap();

        let replies = a.query("other", "x").gather(Duration::from_millis(50)).await;
        assert!(replies.is_empty());
        assert!(a.awaiters.is_empty());
    }

    #[test]
    fn test_parse_query_channel() {
        assert_eq!(parse_query_channel(b"presence/42"), Some(("presence", 42)));
        assert_eq!(parse_query_channel(b"presence/x"), None);
        assert_eq!(parse_query_channel(b"presence"), None);
    }
}
