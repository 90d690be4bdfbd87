//! Replicated events
//!
//! Subscriptions and key bans are the two kinds of facts peers share. Each
//! is encoded to bytes that serve as the key of an LWW set in [`State`].

pub mod lww;
mod state;

pub use lww::{Lww, Time};
pub use state::State;

use std::fmt;

use bytes::Bytes;

use crate::message::Ssid;
use crate::varint::{self, Reader, VarintError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventType {
    Subscription = 1,
    Ban = 2,
}

impl EventType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EventType::Subscription),
            2 => Some(EventType::Ban),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    Varint(VarintError),
    InvalidUtf8,
    UnknownType(u8),
    TrailingData,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Varint(e) => write!(f, "varint: {}", e),
            EventError::InvalidUtf8 => write!(f, "invalid utf-8 in event"),
            EventError::UnknownType(t) => write!(f, "unknown event type {}", t),
            EventError::TrailingData => write!(f, "trailing data after event"),
        }
    }
}

impl std::error::Error for EventError {}

impl From<VarintError> for EventError {
    fn from(e: VarintError) -> Self {
        EventError::Varint(e)
    }
}

pub trait Event: Sized {
    const TYPE: EventType;

    fn encode(&self) -> Vec<u8>;
    fn decode(data: &[u8]) -> Result<Self, EventError>;
}

/// A connection on some peer subscribed to an SSID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub peer: u64,
    pub conn: u64,
    pub user: String,
    pub channel: Bytes,
    pub ssid: Ssid,
}

impl Subscription {
    /// Key prefix shared by every subscription of `peer`.
    pub fn peer_prefix(peer: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(varint::MAX_LEN);
        varint::put_uvarint(&mut buf, peer);
        buf
    }
}

impl Event for Subscription {
    const TYPE: EventType = EventType::Subscription;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.user.len() + self.channel.len() + self.ssid.len() * 5);
        varint::put_uvarint(&mut buf, self.peer);
        varint::put_uvarint(&mut buf, self.conn);
        varint::put_uvarint(&mut buf, self.user.len() as u64);
        buf.extend_from_slice(self.user.as_bytes());
        varint::put_uvarint(&mut buf, self.channel.len() as u64);
        buf.extend_from_slice(&self.channel);
        varint::put_uvarint(&mut buf, self.ssid.len() as u64);
        for part in self.ssid.iter() {
            varint::put_uvarint(&mut buf, *part as u64);
        }
        buf
    }

    fn decode(data: &[u8]) -> Result<Self, EventError> {
        let mut r = Reader::new(data);
        let peer = r.uvarint()?;
        let conn = r.uvarint()?;
        let user = std::str::from_utf8(r.bytes()?)
            .map_err(|_| EventError::InvalidUtf8)?
            .to_string();
        let channel = Bytes::copy_from_slice(r.bytes()?);
        let len = r.uvarint()? as usize;
        let mut ssid = Ssid::default();
        for _ in 0..len {
            ssid.push(r.uvarint()? as u32);
        }
        if r.remaining() != 0 {
            return Err(EventError::TrailingData);
        }
        Ok(Self {
            peer,
            conn,
            user,
            channel,
            ssid,
        })
    }
}

/// A banned key, by its encrypted text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ban(pub String);

impl Event for Ban {
    const TYPE: EventType = EventType::Ban;

    fn encode(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    fn decode(data: &[u8]) -> Result<Self, EventError> {
        std::str::from_utf8(data)
            .map(|s| Ban(s.to_string()))
            .map_err(|_| EventError::InvalidUtf8)
    }
}
