//! Persistent message history on fjall.
//!
//! One partition keyed by message ID; values are the Snappy-encoded message.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::{finish_query, has_indexable_prefix, Result, Storage, StorageError};
use crate::clock::Clock;
use crate::message::{Id, Message};

pub struct FjallStorage {
    keyspace: Keyspace,
    messages: PartitionHandle,
    clock: Clock,
}

impl FjallStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_clock(path, Clock::System)
    }

    pub fn open_with_clock<P: AsRef<Path>>(path: P, clock: Clock) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let messages = keyspace.open_partition("messages", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            messages,
            clock,
        })
    }

    fn collect<I, K, V, E>(iter: I, ssid: &[u32], from: i64, until: i64, limit: usize, now: i64) -> Result<Vec<Message>>
    where
        I: Iterator<Item = std::result::Result<(K, V), E>>,
        V: AsRef<[u8]>,
        StorageError: From<E>,
    {
        let mut found = Vec::new();
        for item in iter {
            if found.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let msg = Message::decode(value.as_ref())?;
            if !msg.is_expired_at(now) && msg.id.matches(ssid, from, until) {
                found.push(msg);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl Storage for FjallStorage {
    async fn store(&self, msg: &Message) -> Result<()> {
        if !msg.stored() {
            return Ok(());
        }
        let bytes = msg.encode()?;
        self.messages.insert(&msg.id.as_bytes()[..], bytes)?;
        Ok(())
    }

    async fn query(&self, ssid: &[u32], from: i64, until: i64, limit: usize) -> Result<Vec<Message>> {
        let now = self.clock.now_secs();
        let found = if has_indexable_prefix(ssid) {
            let prefix = Id::prefix_of(ssid);
            Self::collect(self.messages.prefix(prefix), ssid, from, until, limit, now)?
        } else {
            Self::collect(self.messages.iter(), ssid, from, until, usize::MAX, now)?
        };
        Ok(finish_query(found, limit))
    }

    async fn gc(&self) -> Result<usize> {
        let now = self.clock.now_secs();
        let mut expired = Vec::new();
        for item in self.messages.iter() {
            let (key, value) = item?;
            match Message::decode(&value) {
                Ok(msg) if !msg.is_expired_at(now) => {}
                // Undecodable records are dropped along with expired ones.
                _ => expired.push(key),
            }
        }
        for key in &expired {
            self.messages.remove(&**key)?;
        }
        Ok(expired.len())
    }

    async fn close(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
