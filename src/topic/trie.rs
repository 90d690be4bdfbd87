//! SSID trie
//!
//! Nodes are keyed by SSID element. A subscription lives in the subscriber
//! set of the node at the end of its SSID. Empty nodes are pruned on the way
//! back up from a removal, so the tree only ever holds live paths.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::OnceLock;

use ahash::AHashMap;

use crate::clock;
use crate::hash::{MULTI_WILDCARD, SHARE, WILDCARD};
use crate::topic::subscriber::{Subscriber, SubscriberKey, Subscribers};

/// How a published SSID is matched against subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    /// Subscriptions match every publish below their path; `+` matches one
    /// level. A trailing `#` is equivalent to the bare prefix.
    #[default]
    Emitter,
    /// Exact depth matching; `#` matches the remaining levels.
    Mqtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieError {
    EmptySsid,
}

impl std::fmt::Display for TrieError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrieError::EmptySsid => write!(f, "cannot subscribe to an empty ssid"),
        }
    }
}

impl std::error::Error for TrieError {}

pub type Filter<'a> = Option<&'a dyn Fn(&dyn Subscriber) -> bool>;

#[derive(Default)]
struct Node {
    subs: Subscribers,
    children: AHashMap<u32, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.children.is_empty()
    }
}

pub struct Trie {
    root: Node,
    strategy: MatchStrategy,
    count: usize,
}

impl Trie {
    pub fn new(strategy: MatchStrategy) -> Self {
        Self {
            root: Node::default(),
            strategy,
            count: 0,
        }
    }

    pub fn strategy(&self) -> MatchStrategy {
        self.strategy
    }

    /// Unique (ssid, subscriber) pairs.
    pub fn count(&self) -> usize {
        self.count
    }

    fn path<'a>(&self, ssid: &'a [u32]) -> &'a [u32] {
        match (self.strategy, ssid.split_last()) {
            (MatchStrategy::Emitter, Some((&MULTI_WILDCARD, head))) if !head.is_empty() => head,
            _ => ssid,
        }
    }

    /// Returns true if the subscriber was new at this SSID.
    pub fn subscribe(&mut self, ssid: &[u32], sub: Arc<dyn Subscriber>) -> Result<bool, TrieError> {
        if ssid.is_empty() {
            return Err(TrieError::EmptySsid);
        }

        let path = self.path(ssid);
        let mut node = &mut self.root;
        for part in path {
            node = node.children.entry(*part).or_default();
        }

        let added = node.subs.add(sub);
        if added {
            self.count += 1;
        }
        Ok(added)
    }

    pub fn unsubscribe(&mut self, ssid: &[u32], key: &SubscriberKey) -> bool {
        if ssid.is_empty() {
            return false;
        }
        let path = self.path(ssid);
        let removed = remove(&mut self.root, path, key);
        if removed {
            self.count -= 1;
        }
        removed
    }

    pub fn contains(&self, ssid: &[u32], key: &SubscriberKey) -> bool {
        let mut node = &self.root;
        for part in self.path(ssid) {
            match node.children.get(part) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.subs.contains(key)
    }

    /// Subscribers that should receive a publish to `ssid`.
    pub fn lookup(&self, ssid: &[u32], filter: Filter<'_>) -> Subscribers {
        let mut out = Subscribers::new();
        if ssid.is_empty() {
            return out;
        }

        self.walk(&self.root, ssid, filter, &mut out);

        // One random member per share group.
        let groups = self
            .root
            .children
            .get(&ssid[0])
            .and_then(|contract| contract.children.get(&SHARE));
        if let Some(groups) = groups {
            for group in groups.children.values() {
                let mut candidates = Subscribers::new();
                self.walk(group, &ssid[1..], filter, &mut candidates);
                if let Some(pick) = candidates.pick(xorshift32()) {
                    out.add(pick);
                }
            }
        }

        out
    }

    fn walk(&self, node: &Node, query: &[u32], filter: Filter<'_>, out: &mut Subscribers) {
        match self.strategy {
            MatchStrategy::Emitter => walk_emitter(node, query, filter, out),
            MatchStrategy::Mqtt => walk_mqtt(node, query, filter, out),
        }
    }
}

fn remove(node: &mut Node, path: &[u32], key: &SubscriberKey) -> bool {
    let Some((head, rest)) = path.split_first() else {
        return node.subs.remove(key);
    };
    let Some(child) = node.children.get_mut(head) else {
        return false;
    };

    let removed = remove(child, rest, key);
    if removed && child.is_empty() {
        node.children.remove(head);
    }
    removed
}

fn walk_emitter(node: &Node, query: &[u32], filter: Filter<'_>, out: &mut Subscribers) {
    out.merge(&node.subs, filter);

    let Some((head, rest)) = query.split_first() else {
        return;
    };
    if let Some(child) = node.children.get(head) {
        walk_emitter(child, rest, filter, out);
    }
    if *head != WILDCARD {
        if let Some(child) = node.children.get(&WILDCARD) {
            walk_emitter(child, rest, filter, out);
        }
    }
}

fn walk_mqtt(node: &Node, query: &[u32], filter: Filter<'_>, out: &mut Subscribers) {
    if let Some(multi) = node.children.get(&MULTI_WILDCARD) {
        out.merge(&multi.subs, filter);
    }

    let Some((head, rest)) = query.split_first() else {
        out.merge(&node.subs, filter);
        return;
    };
    if let Some(child) = node.children.get(head) {
        walk_mqtt(child, rest, filter, out);
    }
    if *head != WILDCARD {
        if let Some(child) = node.children.get(&WILDCARD) {
            walk_mqtt(child, rest, filter, out);
        }
    }
}

static SEED: OnceLock<u32> = OnceLock::new();

thread_local! {
    static RNG: Cell<u32> = Cell::new(*SEED.get_or_init(|| (clock::now_nanos() as u32) | 1));
}

/// Per-thread xorshift32.
fn xorshift32() -> u32 {
    RNG.with(|state| {
        let mut x = state.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        state.set(x);
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::message::Message;
    use crate::topic::SubscriberKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestSub {
        id: u64,
        received: AtomicUsize,
    }

    impl Subscriber for TestSub {
        fn id(&self) -> u64 {
            self.id
        }

        fn kind(&self) -> SubscriberKind {
            SubscriberKind::Direct
        }

        fn send(&self, _msg: &Message) -> bool {
            self.received.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    fn sub(id: u64) -> Arc<TestSub> {
        Arc::new(TestSub {
            id,
            received: AtomicUsize::new(0),
        })
    }

    fn ssid(path: &str) -> Vec<u32> {
        std::iter::once(1)
            .chain(path.split('/').filter(|p| !p.is_empty()).map(hash::of))
            .collect()
    }

    fn ids(subs: &Subscribers) -> Vec<u64> {
        let mut ids: Vec<u64> = subs.iter().map(|s| s.id()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_exact_match() {
        for strategy in [MatchStrategy::Emitter, MatchStrategy::Mqtt] {
            let mut trie = Trie::new(strategy);
            trie.subscribe(&ssid("a/b/c"), sub(1)).unwrap();
            assert_eq!(ids(&trie.lookup(&ssid("a/b/c"), None)), vec![1]);
            assert!(trie.lookup(&ssid("a/b/d"), None).is_empty());
        }
    }

    #[test]
    fn test_emitter_prefix_and_wildcard() {
        let mut trie = Trie::new(MatchStrategy::Emitter);
        trie.subscribe(&ssid("a"), sub(1)).unwrap();
        trie.subscribe(&ssid("a/+/c"), sub(2)).unwrap();
        trie.subscribe(&ssid("a/b/#"), sub(3)).unwrap();

        assert_eq!(ids(&trie.lookup(&ssid("a/x/c"), None)), vec![1, 2]);
        assert_eq!(ids(&trie.lookup(&ssid("a/b/c"), None)), vec![1, 2, 3]);
        assert_eq!(ids(&trie.lookup(&ssid("a/b"), None)), vec![1, 3]);
        assert_eq!(ids(&trie.lookup(&ssid("b"), None)), Vec::<u64>::new());
    }

    #[test]
    fn test_mqtt_depth_and_multi_wildcard() {
        let mut trie = Trie::new(MatchStrategy::Mqtt);
        trie.subscribe(&ssid("a"), sub(1)).unwrap();
        trie.subscribe(&ssid("a/+/c"), sub(2)).unwrap();
        trie.subscribe(&ssid("a/#"), sub(3)).unwrap();
        trie.subscribe(&ssid("#"), sub(4)).unwrap();

        assert_eq!(ids(&trie.lookup(&ssid("a/x/c"), None)), vec![2, 3, 4]);
        assert_eq!(ids(&trie.lookup(&ssid("a"), None)), vec![1, 3, 4]);
        assert_eq!(ids(&trie.lookup(&ssid("a/x"), None)), vec![3, 4]);
        assert_eq!(ids(&trie.lookup(&ssid("z"), None)), vec![4]);
    }

    #[test]
    fn test_lookup_is_unique() {
        let mut trie = Trie::new(MatchStrategy::Emitter);
        let s = sub(1);
        trie.subscribe(&ssid("a"), s.clone()).unwrap();
        trie.subscribe(&ssid("a/+"), s.clone()).unwrap();
        trie.subscribe(&ssid("a/b"), s).unwrap();
        assert_eq!(trie.count(), 3);
        assert_eq!(trie.lookup(&ssid("a/b"), None).len(), 1);
    }

    #[test]
    fn test_count_and_prune() {
        let mut trie = Trie::new(MatchStrategy::Emitter);
        let s = sub(1);
        assert!(trie.subscribe(&ssid("a/b/c"), s.clone()).unwrap());
        assert!(!trie.subscribe(&ssid("a/b/c"), s.clone()).unwrap());
        trie.subscribe(&ssid("a/b"), sub(2)).unwrap();
        assert_eq!(trie.count(), 2);

        assert!(trie.unsubscribe(&ssid("a/b/c"), &s.key()));
        assert!(!trie.unsubscribe(&ssid("a/b/c"), &s.key()));
        assert_eq!(trie.count(), 1);

        // a/b stays, its c child is gone.
        let contract = &trie.root.children[&1];
        let b = &contract.children[&hash::of("a")].children[&hash::of("b")];
        assert!(b.children.is_empty());

        assert!(trie.unsubscribe(&ssid("a/b"), &(SubscriberKind::Direct, 2)));
        assert!(trie.root.children.is_empty());
        assert_eq!(trie.count(), 0);
    }

    #[test]
    fn test_empty_ssid_rejected() {
        let mut trie = Trie::new(MatchStrategy::Emitter);
        assert_eq!(trie.subscribe(&[], sub(1)), Err(TrieError::EmptySsid));
        assert!(trie.lookup(&[], None).is_empty());
    }

    #[test]
    fn test_filter_excludes() {
        let mut trie = Trie::new(MatchStrategy::Emitter);
        trie.subscribe(&ssid("a"), sub(1)).unwrap();
        trie.subscribe(&ssid("a"), sub(2)).unwrap();
        let not_one = |s: &dyn Subscriber| s.id() != 1;
        assert_eq!(ids(&trie.lookup(&ssid("a"), Some(&not_one))), vec![2]);
    }

    #[test]
    fn test_share_group_picks_one() {
        for strategy in [MatchStrategy::Emitter, MatchStrategy::Mqtt] {
            let mut trie = Trie::new(strategy);
            let members: Vec<_> = (1..=3).map(sub).collect();
            for m in &members {
                trie.subscribe(&ssid("$share/g1/a"), m.clone()).unwrap();
            }
            trie.subscribe(&ssid("$share/g2/a"), sub(10)).unwrap();
            trie.subscribe(&ssid("a"), sub(20)).unwrap();

            for _ in 0..3000 {
                let found = trie.lookup(&ssid("a"), None);
                let ids = ids(&found);
                assert_eq!(ids.len(), 3);
                assert!(ids.contains(&10) && ids.contains(&20));
                for s in found.iter() {
                    s.send(&Message::new(&[1], "a/", "x"));
                }
            }

            // Uniform within 20% of the expected share.
            for m in &members {
                let n = m.received.load(Ordering::Relaxed);
                assert!((800..=1200).contains(&n), "member {} got {}", m.id, n);
            }
        }
    }

    #[test]
    fn test_xorshift_advances() {
        let a = xorshift32();
        let b = xorshift32();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }
}
