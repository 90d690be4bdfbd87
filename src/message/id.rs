use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::clock::{self, MIN_TIME};
use crate::hash;
use crate::id;
use crate::message::{CodecError, Ssid};

/// Bytes before the SSID.
const FIXED: usize = 16;

/// Message identifier.
///
/// ```text
/// [0..4]   ssid[0] ^ ssid[1]
/// [4..8]   u32::MAX - (seconds since 2018-01-01)
/// [8..12]  u32::MAX - sequence
/// [12..16] process random
/// [16..]   ssid, four bytes per element
/// ```
///
/// Byte order sorts the newest message of an SSID prefix first.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(Bytes);

impl Id {
    pub fn new(ssid: &[u32]) -> Self {
        Self::with_time(ssid, clock::now_secs())
    }

    pub fn with_time(ssid: &[u32], unix_secs: i64) -> Self {
        let offset = (unix_secs - MIN_TIME).clamp(0, u32::MAX as i64) as u32;

        let mut buf = BytesMut::with_capacity(FIXED + ssid.len() * 4);
        buf.put_slice(&Self::prefix_of(ssid));
        buf.put_u32(u32::MAX - offset);
        buf.put_u32(u32::MAX - id::counter());
        buf.put_u32(id::unique());
        for part in ssid {
            buf.put_u32(*part);
        }
        Self(buf.freeze())
    }

    pub fn from_bytes(bytes: Bytes) -> Result<Self, CodecError> {
        if bytes.len() < FIXED + 4 || (bytes.len() - FIXED) % 4 != 0 {
            return Err(CodecError::InvalidId);
        }
        Ok(Self(bytes))
    }

    /// The 4-byte prefix every ID of this SSID starts with.
    pub fn prefix_of(ssid: &[u32]) -> [u8; 4] {
        let a = ssid.first().copied().unwrap_or(0);
        let b = ssid.get(1).copied().unwrap_or(0);
        (a ^ b).to_be_bytes()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    fn u32_at(&self, at: usize) -> u32 {
        let b = &self.0[at..at + 4];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Creation time in unix seconds.
    pub fn time(&self) -> i64 {
        MIN_TIME + (u32::MAX - self.u32_at(4)) as i64
    }

    pub fn ssid_len(&self) -> usize {
        (self.0.len() - FIXED) / 4
    }

    pub fn ssid(&self) -> Ssid {
        (0..self.ssid_len())
            .map(|i| self.u32_at(FIXED + i * 4))
            .collect()
    }

    pub fn contract(&self) -> u32 {
        if self.ssid_len() == 0 {
            return 0;
        }
        self.u32_at(FIXED)
    }

    pub fn has_prefix(&self, ssid: &[u32], cutoff: i64) -> bool {
        self.0[..4] == Self::prefix_of(ssid) && self.time() >= cutoff
    }

    /// Whether the ID falls under `query` (wildcards allowed) within the
    /// `[from, until]` window.
    pub fn matches(&self, query: &[u32], from: i64, until: i64) -> bool {
        // `a/#` also covers `a` itself.
        let query = match query.split_last() {
            Some((&last, head)) if last == hash::MULTI_WILDCARD => head,
            _ => query,
        };
        if query.len() > self.ssid_len() {
            return false;
        }

        for (i, &q) in query.iter().enumerate().rev() {
            if q != hash::WILDCARD && q != hash::MULTI_WILDCARD && q != self.u32_at(FIXED + i * 4) {
                return false;
            }
        }

        let t = self.time();
        from <= t && t <= until
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id(")?;
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000;

    #[test]
    fn test_layout() {
        let id = Id::with_time(&[3, 5, 7], T);
        assert_eq!(id.len(), 16 + 12);
        assert_eq!(&id.as_bytes()[..4], &(3u32 ^ 5).to_be_bytes());
        assert_eq!(id.time(), T);
        assert_eq!(&id.ssid()[..], &[3, 5, 7]);
        assert_eq!(id.contract(), 3);
        assert_eq!(
            &id.as_bytes()[12..16],
            &crate::id::unique().to_be_bytes()
        );
    }

    #[test]
    fn test_newer_sorts_first() {
        let older = Id::with_time(&[1, 2], T);
        let newer = Id::with_time(&[1, 2], T + 1);
        assert!(newer < older);

        // Same second: later sequence sorts first.
        let a = Id::with_time(&[1, 2], T);
        let b = Id::with_time(&[1, 2], T);
        assert!(b < a);
    }

    #[test]
    fn test_time_clamped() {
        assert_eq!(Id::with_time(&[1], 0).time(), MIN_TIME);
    }

    #[test]
    fn test_has_prefix() {
        let id = Id::with_time(&[1, 2, 3], T);
        assert!(id.has_prefix(&[1, 2], T));
        assert!(id.has_prefix(&[1, 2, 99], T - 10));
        assert!(!id.has_prefix(&[1, 2], T + 1));
        assert!(!id.has_prefix(&[1, 4], 0));
    }

    #[test]
    fn test_matches() {
        let a = hash::of("a");
        let b = hash::of("b");
        let id = Id::with_time(&[1, a, b], T);

        assert!(id.matches(&[1, a, b], 0, i64::MAX));
        assert!(id.matches(&[1, a], 0, i64::MAX));
        assert!(id.matches(&[1, hash::WILDCARD, b], 0, i64::MAX));
        assert!(id.matches(&[1, a, hash::MULTI_WILDCARD], 0, i64::MAX));
        assert!(id.matches(&[1, a, b, hash::MULTI_WILDCARD], 0, i64::MAX));
        assert!(!id.matches(&[1, b], 0, i64::MAX));
        assert!(!id.matches(&[1, a, b, a], 0, i64::MAX));
        assert!(!id.matches(&[2, a, b], 0, i64::MAX));

        assert!(id.matches(&[1, a, b], T, T));
        assert!(!id.matches(&[1, a, b], T + 1, i64::MAX));
        assert!(!id.matches(&[1, a, b], 0, T - 1));
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(Id::from_bytes(Bytes::from_static(&[0; 15])).is_err());
        assert!(Id::from_bytes(Bytes::from_static(&[0; 16])).is_err());
        assert!(Id::from_bytes(Bytes::from_static(&[0; 22])).is_err());
        assert!(Id::from_bytes(Bytes::from_static(&[0; 20])).is_ok());
    }
}
