//! Topic part hashing
//!
//! Every channel segment is reduced to a 32-bit murmur3 hash (seed 37). The
//! hash is stable across processes and releases since SSIDs, key targets and
//! replicated subscription events all carry it.

/// Seed shared by every node in a cluster.
pub const SEED: u32 = 37;

/// Hash of the single-level wildcard `+`.
pub const WILDCARD: u32 = murmur32(b"+");

/// Hash of the multi-level wildcard `#`.
pub const MULTI_WILDCARD: u32 = murmur32(b"#");

/// Hash of `$share`, the shared subscription marker.
pub const SHARE: u32 = murmur32(b"$share");

/// Second SSID element of presence notifications.
pub const PRESENCE: u32 = murmur32(b"presence");

/// Second SSID element of survey traffic.
pub const QUERY: u32 = murmur32(b"query");

/// Hash of the empty string, the legacy "match anything" key target.
pub const EMPTY: u32 = murmur32(b"");

// In-band request actions, hashed from the first segment of `emitter/<action>/`.
pub const KEYGEN: u32 = murmur32(b"keygen");
pub const KEYBAN: u32 = murmur32(b"keyban");
pub const LINK: u32 = murmur32(b"link");
pub const ME: u32 = murmur32(b"me");

/// murmur3 x86 32-bit with the cluster seed.
#[inline]
pub const fn murmur32(data: &[u8]) -> u32 {
    murmur32_seeded(data, SEED)
}

/// Hash a string segment.
#[inline]
pub fn of(s: &str) -> u32 {
    murmur32(s.as_bytes())
}

pub const fn murmur32_seeded(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let len = data.len();
    let mut h = seed;
    let mut i = 0;

    while i + 4 <= len {
        let mut k = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
        i += 4;
    }

    let tail = len - i;
    let mut k: u32 = 0;
    if tail == 3 {
        k ^= (data[i + 2] as u32) << 16;
    }
    if tail >= 2 {
        k ^= (data[i + 1] as u32) << 8;
    }
    if tail >= 1 {
        k ^= data[i] as u32;
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= len as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(b"", 0, 0x0000_0000 ; "empty seed zero")]
    #[test_case(b"", 1, 0x514e_28b7 ; "empty seed one")]
    #[test_case(b"hello", 0, 0x248b_fa47 ; "hello")]
    #[test_case(b"The quick brown fox jumps over the lazy dog", 0, 0x2e4f_f723 ; "pangram")]
    fn test_reference_vectors(input: &[u8], seed: u32, expected: u32) {
        assert_eq!(murmur32_seeded(input, seed), expected);
    }

    #[test]
    fn test_seeded_default() {
        assert_eq!(of("a"), murmur32_seeded(b"a", 37));
        assert_ne!(of("a"), of("b"));
        assert_eq!(of("presence"), PRESENCE);
    }

    #[test]
    fn test_reserved_hashes_distinct() {
        let all = [
            WILDCARD, MULTI_WILDCARD, SHARE, PRESENCE, QUERY, EMPTY, KEYGEN, KEYBAN, LINK, ME,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test_case("keygen", KEYGEN)]
    #[test_case("keyban", KEYBAN)]
    #[test_case("link", LINK)]
    #[test_case("me", ME)]
    fn test_request_actions(segment: &str, expected: u32) {
        assert_eq!(of(segment), expected);
    }
}
