//! Key ciphers
//!
//! Keys travel as 32 base64url characters (no padding) wrapping 24 encrypted
//! bytes. The construction depends on the licence version: v1 licences use
//! XTEA, v3 licences use XChaCha20.

mod stream;
mod xtea;

pub use stream::StreamCipher;
pub use xtea::XteaCipher;

use std::fmt;

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;

use crate::security::key::{Key, KEY_LEN};

/// Length of an encrypted key in characters.
pub const ENCODED_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// Ciphertext is not 32 characters long
    InvalidLength,
    /// Ciphertext contains a byte outside the base64url alphabet
    InvalidEncoding,
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherError::InvalidLength => write!(f, "encrypted key has an invalid length"),
            CipherError::InvalidEncoding => write!(f, "encrypted key is not valid base64url"),
        }
    }
}

impl std::error::Error for CipherError {}

pub enum Cipher {
    Xtea(XteaCipher),
    Stream(StreamCipher),
}

impl Cipher {
    pub fn encrypt_key(&self, key: &Key) -> String {
        let mut buf = *key.as_bytes();
        match self {
            Cipher::Xtea(c) => c.encrypt(&mut buf),
            Cipher::Stream(c) => c.apply(&mut buf),
        }
        BASE64_URL_SAFE_NO_PAD.encode(buf)
    }

    pub fn decrypt_key(&self, text: &[u8]) -> Result<Key, CipherError> {
        let mut buf = decode(text)?;
        match self {
            Cipher::Xtea(c) => c.decrypt(&mut buf),
            Cipher::Stream(c) => c.apply(&mut buf),
        }
        Ok(Key::from_bytes(buf))
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cipher::Xtea(_) => write!(f, "Cipher::Xtea"),
            Cipher::Stream(_) => write!(f, "Cipher::Stream"),
        }
    }
}

fn decode(text: &[u8]) -> Result<[u8; KEY_LEN], CipherError> {
    if text.len() != ENCODED_KEY_LEN {
        return Err(CipherError::InvalidLength);
    }
    let mut buf = [0u8; KEY_LEN];
    let n = BASE64_URL_SAFE_NO_PAD
        .decode_slice(text, &mut buf)
        .map_err(|_| CipherError::InvalidEncoding)?;
    if n != KEY_LEN {
        return Err(CipherError::InvalidEncoding);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ciphers() -> Vec<Cipher> {
        vec![
            Cipher::Xtea(XteaCipher::new(&[7u8; 16])),
            Cipher::Stream(StreamCipher::new(&[9u8; 32])),
        ]
    }

    #[test]
    fn test_encoded_length() {
        for cipher in ciphers() {
            let text = cipher.encrypt_key(&Key::new());
            assert_eq!(text.len(), ENCODED_KEY_LEN);
            assert!(text
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        for cipher in ciphers() {
            let text = cipher.encrypt_key(&Key::new());
            assert_eq!(
                cipher.decrypt_key(&text.as_bytes()[..31]),
                Err(CipherError::InvalidLength)
            );
            assert_eq!(cipher.decrypt_key(b""), Err(CipherError::InvalidLength));

            let mut bad = text.into_bytes();
            bad[5] = b'+';
            assert_eq!(cipher.decrypt_key(&bad), Err(CipherError::InvalidEncoding));
            bad[5] = b'=';
            assert_eq!(cipher.decrypt_key(&bad), Err(CipherError::InvalidEncoding));
        }
    }

    #[test]
    fn test_salt_changes_ciphertext() {
        for cipher in ciphers() {
            let mut a = Key::new();
            a.set_contract(42);
            let mut b = a;
            a.set_salt(1);
            b.set_salt(2);

            let (ta, tb) = (cipher.encrypt_key(&a), cipher.encrypt_key(&b));
            assert_ne!(ta[3..], tb[3..]);
        }
    }

    #[test]
    fn test_wrong_secret_scrambles() {
        let mut key = Key::new();
        key.set_contract(42);
        let text = Cipher::Stream(StreamCipher::new(&[1u8; 32])).encrypt_key(&key);
        let other = Cipher::Stream(StreamCipher::new(&[2u8; 32]))
            .decrypt_key(text.as_bytes())
            .unwrap();
        assert_ne!(other.contract(), 42);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(bytes in prop::array::uniform24(any::<u8>())) {
            for cipher in ciphers() {
                let key = Key::from_bytes(bytes);
                let text = cipher.encrypt_key(&key);
                prop_assert_eq!(cipher.decrypt_key(text.as_bytes()), Ok(key));
            }
        }
    }
}
