//! Process-wide identifiers
//!
//! `next()` hands out local connection ids, `unique()` is a random value fixed
//! for the lifetime of the process and mixed into message IDs so that two
//! nodes never mint the same identifier.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

static NEXT: AtomicU64 = AtomicU64::new(0);
static COUNTER: AtomicU32 = AtomicU32::new(0);
static UNIQUE: OnceLock<u32> = OnceLock::new();

/// Next local id, starting at 1.
#[inline]
pub fn next() -> u64 {
    NEXT.fetch_add(1, Ordering::Relaxed) + 1
}

/// Message ID sequence counter; wraps around.
#[inline]
pub fn counter() -> u32 {
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Random per-process value.
pub fn unique() -> u32 {
    *UNIQUE.get_or_init(rand::random::<u32>)
}

/// Random identity for a broker node.
pub fn peer() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

/// Cluster-wide printable name of connection `local` on node `peer`.
///
/// Uses only characters that are valid in a channel segment.
pub fn connection_name(peer: u64, local: u64) -> String {
    format!("{:016X}{:X}", peer, local)
}
