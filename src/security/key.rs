//! Capability keys
//!
//! A key is a 24-byte credential scoped to a contract and a channel shape:
//!
//! ```text
//! [0..2]   salt
//! [2..4]   master id
//! [4..8]   contract
//! [8..12]  signature
//! [12..15] target path bitmap
//! [15]     permissions
//! [16..20] target hash
//! [20..24] expiry, seconds since 2010-01-01 (0 = never)
//! ```
//!
//! Bit 23 of the path bitmap marks a strict target (`a/b/`) as opposed to a
//! wildcard-terminated one (`a/b/#/`). Bits 22..0 flag which positions of the
//! target are literal segments; zero bits stand for `+`.

use std::fmt;

use crate::clock::{self, KEY_EPOCH};
use crate::hash;
use crate::security::channel::Channel;

pub const KEY_LEN: usize = 24;

/// Deepest target a key can encode.
pub const MAX_TARGET_DEPTH: usize = 23;

/// Permission bits.
pub mod perm {
    pub const NONE: u8 = 0;
    pub const MASTER: u8 = 1 << 0;
    pub const READ: u8 = 1 << 1;
    pub const WRITE: u8 = 1 << 2;
    pub const STORE: u8 = 1 << 3;
    pub const LOAD: u8 = 1 << 4;
    pub const PRESENCE: u8 = 1 << 5;
    pub const EXTEND: u8 = 1 << 6;
    pub const EXECUTE: u8 = 1 << 7;
    pub const READ_WRITE: u8 = READ | WRITE;

    /// Parses a key-gen `type` string (`r`, `w`, `s`, `l`, `p`, `e`, `x`).
    /// Unknown letters are ignored and master can never be requested.
    pub fn from_letters(letters: &str) -> u8 {
        letters.chars().fold(NONE, |acc, c| {
            acc | match c {
                'r' => READ,
                'w' => WRITE,
                's' => STORE,
                'l' => LOAD,
                'p' => PRESENCE,
                'e' => EXTEND,
                'x' => EXECUTE,
                _ => NONE,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// Target is missing its trailing slash or is empty
    TargetInvalid,
    /// Target has more than 23 segments
    TargetTooLong,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::TargetInvalid => write!(f, "target channel is invalid"),
            KeyError::TargetTooLong => write!(
                f,
                "target channel exceeds {} segments",
                MAX_TARGET_DEPTH
            ),
        }
    }
}

impl std::error::Error for KeyError {}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    #[inline]
    fn u16_at(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.0[at], self.0[at + 1]])
    }

    #[inline]
    fn u32_at(&self, at: usize) -> u32 {
        u32::from_be_bytes([self.0[at], self.0[at + 1], self.0[at + 2], self.0[at + 3]])
    }

    #[inline]
    fn put_u32(&mut self, at: usize, value: u32) {
        self.0[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn salt(&self) -> u16 {
        self.u16_at(0)
    }

    pub fn set_salt(&mut self, salt: u16) {
        self.0[0..2].copy_from_slice(&salt.to_be_bytes());
    }

    pub fn master(&self) -> u16 {
        self.u16_at(2)
    }

    pub fn set_master(&mut self, id: u16) {
        self.0[2..4].copy_from_slice(&id.to_be_bytes());
    }

    pub fn contract(&self) -> u32 {
        self.u32_at(4)
    }

    pub fn set_contract(&mut self, contract: u32) {
        self.put_u32(4, contract);
    }

    pub fn signature(&self) -> u32 {
        self.u32_at(8)
    }

    pub fn set_signature(&mut self, signature: u32) {
        self.put_u32(8, signature);
    }

    pub fn permissions(&self) -> u8 {
        self.0[15]
    }

    pub fn set_permissions(&mut self, permissions: u8) {
        self.0[15] = permissions;
    }

    #[inline]
    pub fn has_permission(&self, flag: u8) -> bool {
        self.permissions() & flag == flag
    }

    pub fn is_master(&self) -> bool {
        self.has_permission(perm::MASTER)
    }

    /// 24-bit target path bitmap.
    pub fn target_path(&self) -> u32 {
        (self.0[12] as u32) << 16 | (self.0[13] as u32) << 8 | self.0[14] as u32
    }

    pub fn target(&self) -> u32 {
        self.u32_at(16)
    }

    /// Scopes the key to a channel shape such as `a/+/c/` or `a/b/#/`.
    pub fn set_target(&mut self, channel: &str) -> Result<(), KeyError> {
        let path = channel.strip_suffix('/').ok_or(KeyError::TargetInvalid)?;
        if path.is_empty() {
            return Err(KeyError::TargetInvalid);
        }

        let mut parts: Vec<&str> = path.split('/').collect();
        let mut bitmap: u32 = 1 << 23;
        if parts.last() == Some(&"#") {
            bitmap = 0;
            parts.pop();
        }

        if parts.len() > MAX_TARGET_DEPTH {
            return Err(KeyError::TargetTooLong);
        }

        for (i, part) in parts.iter().enumerate() {
            if *part != "+" && *part != "#" {
                bitmap |= 1 << (22 - i);
            }
        }

        self.0[12] = (bitmap >> 16) as u8;
        self.0[13] = (bitmap >> 8) as u8;
        self.0[14] = bitmap as u8;
        self.put_u32(16, hash::of(&parts.join("/")));
        Ok(())
    }

    /// Raw expiry field.
    pub fn expires_raw(&self) -> u32 {
        self.u32_at(20)
    }

    /// Expiry in unix seconds, `None` for keys that never expire.
    pub fn expires(&self) -> Option<i64> {
        match self.expires_raw() {
            0 => None,
            offset => Some(KEY_EPOCH + offset as i64),
        }
    }

    /// Sets expiry from unix seconds; `0` means never.
    pub fn set_expires(&mut self, unix_secs: i64) {
        let offset = if unix_secs <= KEY_EPOCH {
            0
        } else {
            (unix_secs - KEY_EPOCH).min(u32::MAX as i64) as u32
        };
        self.put_u32(20, offset);
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(clock::now_secs())
    }

    pub fn is_expired_at(&self, unix_secs: i64) -> bool {
        self.expires().is_some_and(|t| unix_secs > t)
    }

    /// Checks that the channel falls within the key's target shape.
    pub fn validate_channel(&self, channel: &Channel) -> bool {
        let target = self.target();
        let bitmap = self.target_path();

        // Keys minted before path bitmaps existed only survive as match-all.
        if bitmap == 0 {
            return target == hash::EMPTY;
        }

        let mut parts = channel.parts();
        if parts.last() == Some(&"#") {
            parts.pop();
        }

        let wildcard = bitmap >> 23 == 0;
        let max_depth = (0..MAX_TARGET_DEPTH)
            .find(|i| (bitmap >> i) & 1 == 1)
            .map(|i| MAX_TARGET_DEPTH - i)
            .unwrap_or(parts.len());

        if !wildcard && parts.len() != max_depth {
            return false;
        }
        if parts.len() < max_depth {
            return false;
        }

        for (i, part) in parts.iter_mut().take(max_depth).enumerate() {
            let literal = (bitmap >> (22 - i)) & 1 == 1;
            if !literal {
                *part = "+";
            } else if *part == "+" {
                return false;
            }
        }

        hash::of(&parts[..max_depth].join("/")) == target
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("master", &self.master())
            .field("contract", &self.contract())
            .field("permissions", &format_args!("{:#010b}", self.permissions()))
            .field("target_path", &format_args!("{:#08x}", self.target_path()))
            .field("target", &self.target())
            .field("expires", &self.expires())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn key_for(target: &str) -> Key {
        let mut key = Key::new();
        key.set_contract(1);
        key.set_target(target).unwrap();
        key
    }

    fn channel(path: &str) -> Channel {
        Channel::parse(format!("k/{path}").as_bytes())
    }

    #[test]
    fn test_fields_roundtrip() {
        let mut key = Key::new();
        key.set_salt(0xabcd);
        key.set_master(7);
        key.set_contract(0xdead_beef);
        key.set_signature(0x0102_0304);
        key.set_permissions(perm::READ | perm::STORE);

        assert_eq!(key.salt(), 0xabcd);
        assert_eq!(key.master(), 7);
        assert_eq!(key.contract(), 0xdead_beef);
        assert_eq!(key.signature(), 0x0102_0304);
        assert!(key.has_permission(perm::READ));
        assert!(key.has_permission(perm::STORE));
        assert!(!key.has_permission(perm::READ_WRITE));
        assert!(!key.is_master());
        assert_eq!(&key.as_bytes()[4..8], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_permission_letters() {
        assert_eq!(perm::from_letters("rws"), perm::READ | perm::WRITE | perm::STORE);
        assert_eq!(perm::from_letters("m"), perm::NONE);
        assert_eq!(perm::from_letters("rwslpex"), 0b1111_1110);
    }

    #[test]
    fn test_expiry() {
        let mut key = Key::new();
        assert_eq!(key.expires(), None);
        assert!(!key.is_expired());

        key.set_expires(KEY_EPOCH + 100);
        assert_eq!(key.expires(), Some(KEY_EPOCH + 100));
        assert!(!key.is_expired_at(KEY_EPOCH + 100));
        assert!(key.is_expired_at(KEY_EPOCH + 101));
        assert!(key.is_expired());

        key.set_expires(0);
        assert_eq!(key.expires_raw(), 0);
    }

    #[test]
    fn test_set_target_bitmap() {
        let key = key_for("a/b/");
        assert_eq!(key.target_path(), 1 << 23 | 1 << 22 | 1 << 21);
        assert_eq!(key.target(), hash::of("a/b"));

        let key = key_for("a/+/c/#/");
        assert_eq!(key.target_path(), 1 << 22 | 1 << 20);
        assert_eq!(key.target(), hash::of("a/+/c"));
    }

    #[test]
    fn test_set_target_errors() {
        let mut key = Key::new();
        assert_eq!(key.set_target("a/b"), Err(KeyError::TargetInvalid));
        assert_eq!(key.set_target("/"), Err(KeyError::TargetInvalid));
        let long = "x/".repeat(24);
        assert_eq!(key.set_target(&long), Err(KeyError::TargetTooLong));
        assert!(key.set_target(&"x/".repeat(23)).is_ok());
    }

    #[test_case("a/b/", "a/b/", true ; "strict exact")]
    #[test_case("a/b/", "a/b/c/", false ; "strict deeper")]
    #[test_case("a/b/", "a/", false ; "strict shallower")]
    #[test_case("a/b/", "a/x/", false ; "strict other literal")]
    #[test_case("a/b/#/", "a/b/", true ; "wildcard exact")]
    #[test_case("a/b/#/", "a/b/c/d/", true ; "wildcard deeper")]
    #[test_case("a/b/#/", "a/b/#/", true ; "wildcard subscription")]
    #[test_case("a/b/#/", "a/", false ; "wildcard shallower")]
    #[test_case("a/+/c/", "a/x/c/", true ; "single level")]
    #[test_case("a/+/c/", "a/+/c/", true ; "single level subscription")]
    #[test_case("a/+/c/", "a/x/d/", false ; "single level mismatch")]
    #[test_case("a/b/", "a/+/", false ; "wildcard over literal")]
    #[test_case("a/#/", "a/+/c/", true ; "wildcard tail accepts plus")]
    fn test_validate_channel(target: &str, path: &str, expected: bool) {
        assert_eq!(key_for(target).validate_channel(&channel(path)), expected);
    }

    #[test]
    fn test_validate_legacy_bitmap() {
        let mut key = Key::new();
        key.put_u32(16, hash::EMPTY);
        assert!(key.validate_channel(&channel("anything/at/all/")));

        key.put_u32(16, hash::of("a"));
        assert!(!key.validate_channel(&channel("a/")));
    }

    proptest! {
        #[test]
        fn prop_target_validates_matching_channel(
            parts in prop::collection::vec(prop_oneof![Just(None), "[a-z]{1,6}".prop_map(Some)], 1..10),
            fill in "[a-z]{1,6}",
            tail in prop::collection::vec("[a-z]{1,6}", 0..4),
            wildcard in any::<bool>(),
        ) {
            // The last literal position bounds what a key can verify.
            prop_assume!(matches!(parts.last(), Some(Some(_))));

            let mut target: String = parts
                .iter()
                .map(|p| format!("{}/", p.as_deref().unwrap_or("+")))
                .collect();
            let mut path: String = parts
                .iter()
                .map(|p| format!("{}/", p.as_deref().unwrap_or(fill.as_str())))
                .collect();
            if wildcard {
                target.push_str("#/");
                for t in &tail {
                    path.push_str(t);
                    path.push('/');
                }
            }

            let key = key_for(&target);
            prop_assert!(key.validate_channel(&channel(&path)));
        }
    }
}
