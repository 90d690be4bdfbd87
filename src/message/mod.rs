//! Messages and their wire format
//!
//! A single message is encoded as
//! `uvarint(id-len) id uvarint(channel-len) channel uvarint(payload-len) payload uvarint(ttl)`
//! and Snappy-compressed. A frame is `uvarint(count)` followed by that many
//! uncompressed messages, compressed as a whole.

mod id;
mod ssid;

pub use id::Id;
pub use ssid::Ssid;

use std::fmt;

use bytes::Bytes;

use crate::varint::{self, Reader, VarintError};

/// TTL requested by retained publishes; clamped to the configured retention.
pub const RETAINED_TTL: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Varint(VarintError),
    Snappy(String),
    InvalidId,
    /// Bytes left over after the last field
    TrailingData,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Varint(e) => write!(f, "varint: {}", e),
            CodecError::Snappy(e) => write!(f, "snappy: {}", e),
            CodecError::InvalidId => write!(f, "invalid message id"),
            CodecError::TrailingData => write!(f, "trailing data after message"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<VarintError> for CodecError {
    fn from(e: VarintError) -> Self {
        CodecError::Varint(e)
    }
}

impl From<snap::Error> for CodecError {
    fn from(e: snap::Error) -> Self {
        CodecError::Snappy(e.to_string())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Id,
    pub channel: Bytes,
    pub payload: Bytes,
    /// Seconds to keep the message in storage, 0 for transient
    pub ttl: u32,
}

impl Message {
    pub fn new(ssid: &[u32], channel: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: Id::new(ssid),
            channel: channel.into(),
            payload: payload.into(),
            ttl: 0,
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ssid(&self) -> Ssid {
        self.id.ssid()
    }

    /// Unix seconds.
    pub fn time(&self) -> i64 {
        self.id.time()
    }

    pub fn stored(&self) -> bool {
        self.ttl > 0
    }

    /// Unix second after which the message is gone from storage.
    pub fn expires_at(&self) -> i64 {
        self.time() + self.ttl as i64
    }

    pub fn is_expired_at(&self, unix_secs: i64) -> bool {
        !self.stored() || unix_secs > self.expires_at()
    }

    /// Bytes counted against usage.
    pub fn size(&self) -> usize {
        self.channel.len() + self.payload.len()
    }

    fn write_raw(&self, buf: &mut Vec<u8>) {
        varint::put_uvarint(buf, self.id.len() as u64);
        buf.extend_from_slice(self.id.as_bytes());
        varint::put_uvarint(buf, self.channel.len() as u64);
        buf.extend_from_slice(&self.channel);
        varint::put_uvarint(buf, self.payload.len() as u64);
        buf.extend_from_slice(&self.payload);
        varint::put_uvarint(buf, self.ttl as u64);
    }

    fn read_raw(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let id = Id::from_bytes(Bytes::copy_from_slice(r.bytes()?))?;
        let channel = Bytes::copy_from_slice(r.bytes()?);
        let payload = Bytes::copy_from_slice(r.bytes()?);
        let ttl = r.uvarint()?.min(u32::MAX as u64) as u32;
        Ok(Self {
            id,
            channel,
            payload,
            ttl,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut raw = Vec::with_capacity(self.id.len() + self.size() + 8);
        self.write_raw(&mut raw);
        Ok(snap::raw::Encoder::new().compress_vec(&raw)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let raw = snap::raw::Decoder::new().decompress_vec(data)?;
        let mut r = Reader::new(&raw);
        let msg = Self::read_raw(&mut r)?;
        if r.remaining() != 0 {
            return Err(CodecError::TrailingData);
        }
        Ok(msg)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("channel", &String::from_utf8_lossy(&self.channel))
            .field("payload_len", &self.payload.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// A batch of messages sent to a peer in one write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame(pub Vec<Message>);

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.0.push(msg);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<Message> {
        self.0
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut raw = Vec::new();
        varint::put_uvarint(&mut raw, self.0.len() as u64);
        for msg in &self.0 {
            msg.write_raw(&mut raw);
        }
        Ok(snap::raw::Encoder::new().compress_vec(&raw)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let raw = snap::raw::Decoder::new().decompress_vec(data)?;
        let mut r = Reader::new(&raw);
        let count = r.uvarint()? as usize;
        // Every message takes at least 4 bytes, so bound the allocation.
        let mut messages = Vec::with_capacity(count.min(r.remaining() / 4));
        for _ in 0..count {
            messages.push(Message::read_raw(&mut r)?);
        }
        if r.remaining() != 0 {
            return Err(CodecError::TrailingData);
        }
        Ok(Self(messages))
    }
}

impl From<Vec<Message>> for Frame {
    fn from(messages: Vec<Message>) -> Self {
        Self(messages)
    }
}
