//! Subscription matching
//!
//! [`SubscriptionTrie`] wraps the SSID trie in a readers/writer lock: lookups
//! run concurrently, subscribe and unsubscribe (pruning included) take the
//! lock exclusively so readers never see a half-pruned tree.

mod subscriber;
mod trie;

pub use subscriber::{Subscriber, SubscriberKey, SubscriberKind, Subscribers};
pub use trie::{Filter, MatchStrategy, Trie, TrieError};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::hash;

/// Thread-safe subscription trie
pub struct SubscriptionTrie {
    trie: RwLock<Trie>,
}

impl SubscriptionTrie {
    pub fn new(strategy: MatchStrategy) -> Self {
        Self {
            trie: RwLock::new(Trie::new(strategy)),
        }
    }

    pub fn strategy(&self) -> MatchStrategy {
        self.trie.read().strategy()
    }

    /// Returns true if the subscriber was new at this SSID.
    pub fn subscribe(&self, ssid: &[u32], sub: Arc<dyn Subscriber>) -> Result<bool, TrieError> {
        self.trie.write().subscribe(ssid, sub)
    }

    /// Subscribes to every SSID below `prefix`, under either strategy.
    pub fn subscribe_subtree(&self, prefix: &[u32], sub: Arc<dyn Subscriber>) -> Result<bool, TrieError> {
        let mut ssid = prefix.to_vec();
        ssid.push(hash::MULTI_WILDCARD);
        self.subscribe(&ssid, sub)
    }

    pub fn unsubscribe(&self, ssid: &[u32], key: &SubscriberKey) -> bool {
        self.trie.write().unsubscribe(ssid, key)
    }

    pub fn contains(&self, ssid: &[u32], key: &SubscriberKey) -> bool {
        self.trie.read().contains(ssid, key)
    }

    pub fn lookup(&self, ssid: &[u32], filter: Filter<'_>) -> Subscribers {
        self.trie.read().lookup(ssid, filter)
    }

    pub fn count(&self) -> usize {
        self.trie.read().count()
    }
}

impl Default for SubscriptionTrie {
    fn default() -> Self {
        Self::new(MatchStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::message::Message;
    use std::thread;

    struct Sink(u64);

    impl Subscriber for Sink {
        fn id(&self) -> u64 {
            self.0
        }

        fn kind(&self) -> SubscriberKind {
            SubscriberKind::System
        }

        fn send(&self, _msg: &Message) -> bool {
            true
        }
    }

    #[test]
    fn test_concurrent_subscribe_and_lookup() {
        let trie = Arc::new(SubscriptionTrie::new(MatchStrategy::Emitter));
        let a = hash::of("a");

        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let trie = trie.clone();
                thread::spawn(move || {
                    for i in 0..250u64 {
                        let id = t * 1000 + i;
                        trie.subscribe(&[1, a, id as u32], Arc::new(Sink(id))).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let trie = trie.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let _ = trie.lookup(&[1, a, 5], None);
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(trie.count(), 1000);

        for t in 0..4u64 {
            for i in 0..250u64 {
                let id = t * 1000 + i;
                assert!(trie.unsubscribe(&[1, a, id as u32], &(SubscriberKind::System, id)));
            }
        }
        assert_eq!(trie.count(), 0);
    }

    #[test]
    fn test_surveyor_style_subtree() {
        // [0, QUERY, #] reaches every request id under both strategies.
        for strategy in [MatchStrategy::Emitter, MatchStrategy::Mqtt] {
            let trie = SubscriptionTrie::new(strategy);
            trie.subscribe_subtree(&[0, hash::QUERY], Arc::new(Sink(1)))
                .unwrap();
            assert_eq!(trie.lookup(&[0, hash::QUERY, 77], None).len(), 1);
            assert_eq!(trie.strategy(), strategy);
        }
    }
}
