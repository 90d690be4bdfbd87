//! Presence
//!
//! Subscribe and unsubscribe events are queued and published in batches
//! under `[0, PRESENCE, ...ssid]` to clients that asked for changes. A
//! `status` request lists who is subscribed to a channel on every peer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{to_json, Error, Service};
use crate::cluster::Surveyee;
use crate::event::State;
use crate::id;
use crate::message::{Message, Ssid};
use crate::security::{perm, Channel};
use crate::session::Session;

pub const SURVEY: &str = "presence";

/// Channel presence notifications and replies are sent on.
pub const CHANNEL: &str = "emitter/presence/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    Status,
    Subscribe,
    Unsubscribe,
}

/// A subscribed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Who {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

/// Client request on `emitter/presence/`.
#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    #[serde(default)]
    pub req: u16,
    pub key: String,
    pub channel: String,
    #[serde(default = "default_status")]
    pub status: bool,
    #[serde(default)]
    pub changes: Option<bool>,
}

fn default_status() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub req: u16,
    pub time: i64,
    pub event: PresenceEvent,
    pub channel: String,
    pub who: Vec<Who>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceNotification {
    pub time: i64,
    pub event: PresenceEvent,
    pub channel: String,
    pub who: Who,
}

/// Pending notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub ssid: Ssid,
    pub body: PresenceNotification,
}

impl Notification {
    pub fn to_message(&self) -> Option<Message> {
        let payload = serde_json::to_vec(&self.body).ok()?;
        Some(Message::new(&self.ssid.presence(), CHANNEL, payload))
    }
}

/// Bounded queue between subscription changes and the notifier task.
pub struct PresenceQueue {
    queue: ArrayQueue<Notification>,
}

impl PresenceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Queues a notification; drops it when full.
    pub fn push(&self, notification: Notification) -> bool {
        match self.queue.push(notification) {
            Ok(()) => true,
            Err(n) => {
                debug!("Presence queue full, dropping {:?} for {}", n.body.event, n.body.channel);
                false
            }
        }
    }

    pub fn drain(&self) -> Vec<Notification> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Subscribers of `ssid` on the node `peer_id`, from the replicated state.
pub fn local_subscribers(state: &State, peer_id: u64, ssid: &[u32]) -> Vec<Who> {
    let mut who = Vec::new();
    state.subscriptions_of(peer_id, |ev| {
        if &*ev.ssid == ssid {
            who.push(Who {
                id: id::connection_name(ev.peer, ev.conn),
                username: ev.user.clone(),
            });
        }
    });
    who
}

/// Answers `presence` surveys with the local subscribers of an SSID.
pub struct PresenceSurveyee {
    state: Arc<State>,
    peer_id: u64,
}

impl PresenceSurveyee {
    pub fn new(state: Arc<State>, peer_id: u64) -> Self {
        Self { state, peer_id }
    }
}

#[async_trait]
impl Surveyee for PresenceSurveyee {
    async fn on_survey(&self, kind: &str, payload: &[u8]) -> Option<Vec<u8>> {
        if kind != SURVEY {
            return None;
        }
        let ssid = Ssid::from_bytes(payload)?;
        let who = local_subscribers(&self.state, self.peer_id, &ssid);
        serde_json::to_vec(&who).ok()
    }
}

/// Joins survey replies into `who`, skipping duplicates.
pub fn merge_replies(who: &mut Vec<Who>, replies: &[Bytes]) {
    for reply in replies {
        match serde_json::from_slice::<Vec<Who>>(reply) {
            Ok(remote) => {
                for w in remote {
                    if !who.contains(&w) {
                        who.push(w);
                    }
                }
            }
            Err(e) => debug!("Ignoring malformed presence reply: {}", e),
        }
    }
}

impl Service {
    pub(super) async fn on_presence(&self, conn: &Arc<Session>, payload: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let request: PresenceRequest = serde_json::from_slice(payload).map_err(|_| Error::BadRequest)?;
        let channel = Channel::parse(format!("{}/{}", request.key, request.channel).as_bytes());
        let (contract, key) = self.authorize(&channel, perm::PRESENCE)?;
        if key.has_permission(perm::EXTEND) {
            return Err(Error::Unauthorized);
        }

        let ssid = Ssid::new(contract.id(), &channel.query);
        match request.changes {
            Some(true) => self.subscribe(conn, &ssid.presence(), CHANNEL.as_bytes())?,
            Some(false) => self.unsubscribe(conn, &ssid.presence()),
            None => {}
        }
        if !request.status {
            return Ok(None);
        }

        let mut who = local_subscribers(&self.state, self.peer_id, &ssid);
        if self.network.num_peers() > 0 {
            let replies = self
                .surveyor
                .query(SURVEY, ssid.to_bytes())
                .gather(self.survey_timeout)
                .await;
            merge_replies(&mut who, &replies);
        }

        to_json(&PresenceResponse {
            req: request.req,
            time: self.clock.now_secs(),
            event: PresenceEvent::Status,
            channel: request.channel,
            who,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::event::Subscription;
    use crate::hash;

    fn sub(peer: u64, conn: u64, user: &str, ssid: &[u32]) -> Subscription {
        Subscription {
            peer,
            conn,
            user: user.into(),
            channel: Bytes::from_static(b"a/"),
            ssid: Ssid::from_slice(ssid),
        }
    }

    fn notification(channel: &str) -> Notification {
        Notification {
            ssid: Ssid::from_slice(&[1, 2]),
            body: PresenceNotification {
                time: 1,
                event: PresenceEvent::Subscribe,
                channel: channel.into(),
                who: Who {
                    id: "A".into(),
                    username: "u".into(),
                },
            },
        }
    }

    #[test]
    fn test_queue_drops_when_full() {
        let queue = PresenceQueue::new(2);
        assert!(queue.push(notification("a/")));
        assert!(queue.push(notification("b/")));
        assert!(!queue.push(notification("c/")));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].body.channel, "a/");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_notification_message() {
        let msg = notification("a/").to_message().unwrap();
        assert_eq!(&*msg.ssid(), &[0, hash::PRESENCE, 1, 2]);
        assert_eq!(msg.channel.as_ref(), CHANNEL.as_bytes());

        let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body["event"], "subscribe");
        assert_eq!(body["channel"], "a/");
        assert_eq!(body["who"]["id"], "A");
        assert_eq!(body["who"]["username"], "u");
    }

    #[test]
    fn test_local_subscribers() {
        let state = State::new(Clock::default());
        state.add(&sub(1, 10, "alice", &[1, 2]));
        state.add(&sub(1, 11, "bob", &[1, 3]));
        state.add(&sub(2, 12, "carol", &[1, 2]));

        let who = local_subscribers(&state, 1, &[1, 2]);
        assert_eq!(
            who,
            vec![Who {
                id: id::connection_name(1, 10),
                username: "alice".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_surveyee() {
        let state = Arc::new(State::new(Clock::default()));
        state.add(&sub(7, 1, "alice", &[1, 2]));
        let surveyee = PresenceSurveyee::new(state, 7);

        let ssid = Ssid::from_slice(&[1, 2]);
        assert!(surveyee.on_survey("history", &ssid.to_bytes()).await.is_none());

        let reply = surveyee.on_survey(SURVEY, &ssid.to_bytes()).await.unwrap();
        let mut who = Vec::new();
        merge_replies(&mut who, &[Bytes::from(reply.clone()), Bytes::from(reply)]);
        assert_eq!(who.len(), 1);
        assert_eq!(who[0].username, "alice");
    }

    #[test]
    fn test_request_defaults() {
        let req: PresenceRequest = serde_json::from_str(r#"{"key":"k","channel":"a/"}"#).unwrap();
        assert!(req.status);
        assert_eq!(req.changes, None);
        assert_eq!(req.req, 0);
    }
}
