use std::fmt;
use std::ops::Deref;

use smallvec::SmallVec;

use crate::hash;

/// Subscription identifier: `[contract, hash(part0), hash(part1), ...]`.
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Ssid(SmallVec<[u32; 8]>);

impl Ssid {
    pub fn new(contract: u32, query: &[u32]) -> Self {
        let mut parts = SmallVec::with_capacity(query.len() + 1);
        parts.push(contract);
        parts.extend_from_slice(query);
        Self(parts)
    }

    pub fn from_slice(parts: &[u32]) -> Self {
        Self(SmallVec::from_slice(parts))
    }

    pub fn contract(&self) -> u32 {
        self.0.first().copied().unwrap_or(0)
    }

    /// `[0, PRESENCE, ...self]`, where presence notifications for this SSID
    /// are published.
    pub fn presence(&self) -> Self {
        let mut parts = SmallVec::with_capacity(self.0.len() + 2);
        parts.push(0);
        parts.push(hash::PRESENCE);
        parts.extend_from_slice(&self.0);
        Self(parts)
    }

    /// `[0, QUERY, request]`
    pub fn query(request: u32) -> Self {
        Self::from_slice(&[0, hash::QUERY, request])
    }

    pub fn is_system(&self) -> bool {
        self.contract() == 0
    }

    /// Big-endian bytes, four per element.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|p| p.to_be_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        Some(Self(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ))
    }

    pub fn push(&mut self, part: u32) {
        self.0.push(part);
    }
}

impl Deref for Ssid {
    type Target = [u32];

    fn deref(&self) -> &[u32] {
        &self.0
    }
}

impl From<&[u32]> for Ssid {
    fn from(parts: &[u32]) -> Self {
        Self::from_slice(parts)
    }
}

impl FromIterator<u32> for Ssid {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Debug for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}
