use std::collections::BTreeMap;

use crate::clock::Clock;
use crate::event::lww::{Lww, Time, DEFAULT_MAX_FRAME_ENTRIES};
use crate::event::{Event, EventError, EventType, Subscription};
use crate::varint::{self, Reader};

/// Replicated state: one LWW set per event type.
///
/// Gossip frame layout: `uvarint(tag count)`, then for each tag the tag byte
/// followed by the encoded LWW set.
pub struct State {
    maps: BTreeMap<u8, Lww>,
    clock: Clock,
    max_frame_entries: usize,
}

impl State {
    pub fn new(clock: Clock) -> Self {
        let mut maps = BTreeMap::new();
        for t in [EventType::Subscription, EventType::Ban] {
            maps.insert(t as u8, Lww::new(clock.clone()));
        }
        Self {
            maps,
            clock,
            max_frame_entries: DEFAULT_MAX_FRAME_ENTRIES,
        }
    }

    pub fn with_max_frame_entries(mut self, max: usize) -> Self {
        self.max_frame_entries = max.max(1);
        self
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn map(&mut self, tag: u8) -> &Lww {
        let clock = self.clock.clone();
        self.maps.entry(tag).or_insert_with(|| Lww::new(clock))
    }

    fn get(&self, t: EventType) -> Option<&Lww> {
        self.maps.get(&(t as u8))
    }

    pub fn add<E: Event>(&self, ev: &E) {
        if let Some(map) = self.get(E::TYPE) {
            map.add(&ev.encode());
        }
    }

    pub fn remove<E: Event>(&self, ev: &E) {
        if let Some(map) = self.get(E::TYPE) {
            map.remove(&ev.encode());
        }
    }

    pub fn contains<E: Event>(&self, ev: &E) -> bool {
        self.get(E::TYPE)
            .is_some_and(|map| map.contains(&ev.encode()))
    }

    /// Every subscription with its LWW time. Entries are collected before
    /// `f` runs so `f` may take other locks.
    pub fn subscriptions<F>(&self, mut f: F)
    where
        F: FnMut(&Subscription, Time),
    {
        for (ev, time) in self.collect_subscriptions(&[], false) {
            f(&ev, time);
        }
    }

    /// Currently added subscriptions of one peer.
    pub fn subscriptions_of<F>(&self, peer: u64, mut f: F)
    where
        F: FnMut(&Subscription),
    {
        let prefix = Subscription::peer_prefix(peer);
        for (ev, _) in self.collect_subscriptions(&prefix, true) {
            f(&ev);
        }
    }

    fn collect_subscriptions(&self, prefix: &[u8], added_only: bool) -> Vec<(Subscription, Time)> {
        let mut out = Vec::new();
        if let Some(map) = self.get(EventType::Subscription) {
            map.range(prefix, |key, time| {
                if !added_only || time.is_added() {
                    match Subscription::decode(key) {
                        Ok(ev) => out.push((ev, time)),
                        Err(e) => tracing::debug!("Skipping undecodable subscription: {}", e),
                    }
                }
                true
            });
        }
        out
    }

    /// Merges `other` in and returns what was new to us, or `None` when
    /// nothing was.
    pub fn merge(&self, mut other: State) -> Option<State> {
        let mut changed = false;
        for (tag, remote) in other.maps.iter_mut() {
            // Unknown tags from newer peers are ignored.
            let Some(local) = self.maps.get(tag) else {
                continue;
            };
            local.merge(remote);
            changed |= !remote.is_empty();
        }
        other.maps.retain(|tag, _| self.maps.contains_key(tag));
        changed.then_some(other)
    }

    /// Collects the current timestamps of the given keys into a delta.
    pub fn select(&self, keys: &[(EventType, Vec<u8>)]) -> State {
        let mut delta = State::new(self.clock.clone()).with_max_frame_entries(self.max_frame_entries);
        for (t, key) in keys {
            if let Some(time) = self.get(*t).and_then(|m| m.get(key)) {
                delta.map(*t as u8).insert(key.clone(), time);
            }
        }
        delta
    }

    pub fn gc(&self) -> usize {
        self.maps.values().map(|m| m.gc()).sum()
    }

    pub fn len(&self) -> usize {
        self.maps.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.values().all(|m| m.is_empty())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        varint::put_uvarint(&mut buf, self.maps.len() as u64);
        for (tag, map) in &self.maps {
            buf.push(*tag);
            map.encode_into(&mut buf, self.max_frame_entries);
        }
        buf
    }

    pub fn decode(data: &[u8], clock: Clock) -> Result<State, EventError> {
        let mut state = State::new(clock.clone());
        let mut r = Reader::new(data);
        let count = r.uvarint()?;
        for _ in 0..count {
            let tag = r.byte()?;
            let map = Lww::decode_from(&mut r, clock.clone())?;
            state.maps.insert(tag, map);
        }
        if r.remaining() != 0 {
            return Err(EventError::TrailingData);
        }
        Ok(state)
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("State");
        for (tag, map) in &self.maps {
            match EventType::from_u8(*tag) {
                Some(t) => s.field(&format!("{:?}", t), &map.len()),
                None => s.field(&format!("tag{}", tag), &map.len()),
            };
        }
        s.finish()
    }
}
