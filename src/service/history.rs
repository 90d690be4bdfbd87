//! Cluster-wide message history.
//!
//! Subscribers asking for `last` messages get local storage results merged
//! with whatever the other peers hold, gathered through a `history` survey.

use std::sync::Arc;

use ahash::AHashSet;
use async_trait::async_trait;
use tracing::warn;

use crate::cluster::Surveyee;
use crate::message::{Frame, Message, Ssid};
use crate::storage::{self, Storage};
use crate::varint::{self, Reader, VarintError};

pub const SURVEY: &str = "history";

/// Parameters of a history lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub ssid: Ssid,
    pub from: i64,
    pub until: i64,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.ssid.len() * 5 + 3 * varint::MAX_LEN);
        varint::put_uvarint(&mut buf, self.ssid.len() as u64);
        for part in self.ssid.iter() {
            varint::put_uvarint(&mut buf, *part as u64);
        }
        varint::put_varint(&mut buf, self.from);
        varint::put_varint(&mut buf, self.until);
        varint::put_uvarint(&mut buf, self.limit as u64);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, VarintError> {
        let mut r = Reader::new(data);
        let len = r.uvarint()? as usize;
        let mut ssid = Ssid::default();
        for _ in 0..len {
            ssid.push(r.uvarint()? as u32);
        }
        Ok(Self {
            ssid,
            from: r.varint()?,
            until: r.varint()?,
            limit: r.uvarint()? as usize,
        })
    }
}

/// Answers `history` surveys from local storage.
pub struct HistorySurveyee {
    storage: Arc<dyn Storage>,
}

impl HistorySurveyee {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Surveyee for HistorySurveyee {
    async fn on_survey(&self, kind: &str, payload: &[u8]) -> Option<Vec<u8>> {
        if kind != SURVEY {
            return None;
        }
        let query = HistoryQuery::decode(payload).ok()?;
        let found = match self
            .storage
            .query(&query.ssid, query.from, query.until, query.limit)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!("History survey failed: {}", e);
                Vec::new()
            }
        };
        Frame::from(found).encode().ok()
    }
}

/// Merges local and remote results: drops duplicates, keeps the newest
/// `limit`, oldest first.
pub fn merge(local: Vec<Message>, remote: Vec<Message>, limit: usize) -> Vec<Message> {
    let mut seen = AHashSet::with_capacity(local.len() + remote.len());
    let mut all: Vec<Message> = local.into_iter().chain(remote).collect();
    all.retain(|m| seen.insert(m.id.clone()));
    storage::finish_query(all, limit)
}
