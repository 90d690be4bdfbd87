//! Subscribers and subscriber sets

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ahash::RandomState;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriberKind {
    /// A client connected to this node
    Direct,
    /// Another node that has clients subscribed
    Remote,
    /// In-process consumers such as the surveyor
    System,
}

/// Identity of a subscriber inside a trie.
pub type SubscriberKey = (SubscriberKind, u64);

pub trait Subscriber: Send + Sync {
    fn id(&self) -> u64;

    fn kind(&self) -> SubscriberKind;

    /// Queues the message. Never blocks; returns false if it was dropped.
    fn send(&self, msg: &Message) -> bool;

    fn key(&self) -> SubscriberKey {
        (self.kind(), self.id())
    }
}

/// Set of subscribers, unique by [`SubscriberKey`].
#[derive(Clone, Default)]
pub struct Subscribers(HashMap<SubscriberKey, Arc<dyn Subscriber>, RandomState>);

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the subscriber was not present yet.
    pub fn add(&mut self, sub: Arc<dyn Subscriber>) -> bool {
        self.0.insert(sub.key(), sub).is_none()
    }

    pub fn remove(&mut self, key: &SubscriberKey) -> bool {
        self.0.remove(key).is_some()
    }

    pub fn contains(&self, key: &SubscriberKey) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Subscriber>> {
        self.0.values()
    }

    /// Adds every subscriber of `other` accepted by `filter`.
    pub fn merge(&mut self, other: &Subscribers, filter: Option<&dyn Fn(&dyn Subscriber) -> bool>) {
        for (key, sub) in &other.0 {
            if filter.map_or(true, |f| f(sub.as_ref())) {
                self.0.entry(*key).or_insert_with(|| sub.clone());
            }
        }
    }

    /// Picks one subscriber using `roll` as the random source.
    pub fn pick(&self, roll: u32) -> Option<Arc<dyn Subscriber>> {
        if self.0.is_empty() {
            return None;
        }
        let n = roll as usize % self.0.len();
        self.0.values().nth(n).cloned()
    }
}

impl IntoIterator for Subscribers {
    type Item = Arc<dyn Subscriber>;
    type IntoIter = std::collections::hash_map::IntoValues<SubscriberKey, Arc<dyn Subscriber>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}
