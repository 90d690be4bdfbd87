//! In-memory message index ordered by message ID.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{finish_query, has_indexable_prefix, Result, Storage};
use crate::clock::Clock;
use crate::message::{Id, Message};

pub struct MemoryStorage {
    messages: RwLock<BTreeMap<Bytes, Message>>,
    clock: Clock,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Clock::System)
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            messages: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, msg: &Message) -> Result<()> {
        if msg.stored() {
            self.messages
                .write()
                .insert(msg.id.as_bytes().clone(), msg.clone());
        }
        Ok(())
    }

    async fn query(&self, ssid: &[u32], from: i64, until: i64, limit: usize) -> Result<Vec<Message>> {
        let now = self.clock.now_secs();
        let messages = self.messages.read();
        let visible = |m: &&Message| !m.is_expired_at(now) && m.id.matches(ssid, from, until);

        let found = if has_indexable_prefix(ssid) {
            let prefix = Id::prefix_of(ssid);
            messages
                .range::<[u8], _>((Bound::Included(&prefix[..]), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(_, m)| m)
                .filter(visible)
                .take(limit)
                .cloned()
                .collect()
        } else {
            messages.values().filter(visible).cloned().collect()
        };

        Ok(finish_query(found, limit))
    }

    async fn gc(&self) -> Result<usize> {
        let now = self.clock.now_secs();
        let mut messages = self.messages.write();
        let before = messages.len();
        messages.retain(|_, m| !m.is_expired_at(now));
        Ok(before - messages.len())
    }
}
