//! Message history
//!
//! Messages published with a TTL by a key holding the store permission are
//! appended here and served back to subscribers asking for `last` messages.
//! Keys are message IDs, so a 4-byte SSID prefix scan yields the newest
//! messages of a channel first.

mod error;
mod fjall;
mod memory;

pub use self::fjall::FjallStorage;
pub use error::{Result, StorageError};
pub use memory::MemoryStorage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::hash::{MULTI_WILDCARD, WILDCARD};
use crate::message::Message;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Appends a message. Messages without TTL are ignored.
    async fn store(&self, msg: &Message) -> Result<()>;

    /// Up to `limit` of the newest unexpired messages matching `ssid` within
    /// `[from, until]` (unix seconds), oldest first.
    async fn query(&self, ssid: &[u32], from: i64, until: i64, limit: usize) -> Result<Vec<Message>>;

    /// Drops expired messages; returns how many.
    async fn gc(&self) -> Result<usize>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Discards everything.
pub struct NoopStorage;

#[async_trait]
impl Storage for NoopStorage {
    async fn store(&self, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _ssid: &[u32], _from: i64, _until: i64, _limit: usize) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn gc(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Whether a query can use the `ssid[0] ^ ssid[1]` prefix index.
pub(crate) fn has_indexable_prefix(ssid: &[u32]) -> bool {
    matches!(ssid.get(1), Some(p) if *p != WILDCARD && *p != MULTI_WILDCARD)
}

/// Sorts candidates newest first, truncates to `limit` and returns them
/// oldest first.
pub(crate) fn finish_query(mut found: Vec<Message>, limit: usize) -> Vec<Message> {
    // ID bytes after the prefix order newest first.
    found.sort_by(|a, b| a.id.as_bytes()[4..].cmp(&b.id.as_bytes()[4..]));
    found.truncate(limit);
    found.reverse();
    found
}

/// Periodic expiry sweep; stops on shutdown.
pub fn spawn_gc(
    storage: Arc<dyn Storage>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match storage.gc().await {
                        Ok(0) => {}
                        Ok(n) => debug!("Storage GC removed {} expired messages", n),
                        Err(e) => warn!("Storage GC failed: {}", e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
