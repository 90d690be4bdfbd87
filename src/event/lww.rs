//! Last-write-wins set
//!
//! Each key maps to an `(add, del)` pair of unix nanosecond timestamps. The
//! larger timestamp of each side wins on merge, which makes merges
//! commutative and idempotent. Removed entries linger for [`GC_HORIZON`] so
//! late adds from lagging peers cannot resurrect them.

use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use crate::clock::Clock;
use crate::varint::{self, Reader, VarintError};

/// How long tombstones are kept.
pub const GC_HORIZON: Duration = Duration::from_secs(6 * 60 * 60);

/// Default maximum number of entries in one encoded frame.
pub const DEFAULT_MAX_FRAME_ENTRIES: usize = 100_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Time {
    pub added: i64,
    pub deleted: i64,
}

impl Time {
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.added == 0 && self.deleted == 0
    }

    #[inline]
    pub fn is_added(&self) -> bool {
        self.added != 0 && self.added >= self.deleted
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.added < self.deleted
    }

    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.is_removed() && self.deleted + (GC_HORIZON.as_nanos() as i64) < now
    }
}

pub type Entries = AHashMap<Vec<u8>, Time>;

pub struct Lww {
    entries: Mutex<Entries>,
    clock: Clock,
}

impl Lww {
    pub fn new(clock: Clock) -> Self {
        Self::from_entries(Entries::default(), clock)
    }

    pub fn from_entries(entries: Entries, clock: Clock) -> Self {
        Self {
            entries: Mutex::new(entries),
            clock,
        }
    }

    pub fn add(&self, key: &[u8]) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.entry(key.to_vec()).or_default().added = now;
    }

    pub fn remove(&self, key: &[u8]) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.entry(key.to_vec()).or_default().deleted = now;
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|t| t.is_added())
    }

    pub fn get(&self, key: &[u8]) -> Option<Time> {
        self.entries.lock().get(key).copied()
    }

    /// Sets an entry directly; used to build deltas from known timestamps.
    pub fn insert(&self, key: Vec<u8>, time: Time) {
        self.entries.lock().insert(key, time);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Merges `other` into this set. On return `other` only holds what this
    /// set did not already know, i.e. the delta worth gossiping further.
    pub fn merge(&self, other: &mut Lww) {
        let mut local = self.entries.lock();
        other.entries.get_mut().retain(|key, remote| {
            let mut lt = local.get(key).copied().unwrap_or_default();

            if lt.added < remote.added {
                lt.added = remote.added;
            } else {
                remote.added = 0;
            }

            if lt.deleted < remote.deleted {
                lt.deleted = remote.deleted;
            } else {
                remote.deleted = 0;
            }

            if remote.is_zero() {
                return false;
            }
            local.insert(key.clone(), lt);
            true
        });
    }

    /// Drops tombstones older than the GC horizon. Returns how many went.
    pub fn gc(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, t| !t.is_expired(now));
        before - entries.len()
    }

    /// Visits entries whose key starts with `prefix` until `f` returns false.
    /// Runs under the lock: `f` must not block.
    pub fn range<F>(&self, prefix: &[u8], mut f: F)
    where
        F: FnMut(&[u8], Time) -> bool,
    {
        let entries = self.entries.lock();
        for (key, time) in entries.iter() {
            if key.starts_with(prefix) && !f(key, *time) {
                return;
            }
        }
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> Entries {
        self.entries.lock().clone()
    }

    /// Encodes at most `max_entries` entries; larger sets emit a random
    /// sample of that size.
    pub fn encode_into(&self, buf: &mut Vec<u8>, max_entries: usize) {
        let entries = self.entries.lock();
        if entries.len() <= max_entries {
            varint::put_uvarint(buf, entries.len() as u64);
            for (key, time) in entries.iter() {
                encode_entry(buf, key, time);
            }
            return;
        }

        let sample = entries
            .iter()
            .choose_multiple(&mut rand::thread_rng(), max_entries);
        varint::put_uvarint(buf, sample.len() as u64);
        for (key, time) in sample {
            encode_entry(buf, key, time);
        }
    }

    pub fn encode(&self, max_entries: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf, max_entries);
        buf
    }

    pub fn decode_from(r: &mut Reader<'_>, clock: Clock) -> Result<Self, VarintError> {
        let count = r.uvarint()? as usize;
        // Each entry needs at least three bytes.
        let mut entries = Entries::with_capacity(count.min(r.remaining() / 3));
        for _ in 0..count {
            let added = r.varint()?;
            let deleted = r.varint()?;
            let key = r.bytes()?.to_vec();
            entries.insert(key, Time { added, deleted });
        }
        Ok(Self::from_entries(entries, clock))
    }
}

fn encode_entry(buf: &mut Vec<u8>, key: &[u8], time: &Time) {
    varint::put_varint(buf, time.added);
    varint::put_varint(buf, time.deleted);
    varint::put_uvarint(buf, key.len() as u64);
    buf.extend_from_slice(key);
}
