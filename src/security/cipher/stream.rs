//! XChaCha20 key cipher, used by v3 licences.
//!
//! The salt (bytes 0..2) stays readable and perturbs the nonce, the rest of
//! the key is XORed with the keystream.

use chacha20::cipher::{KeyIvInit, StreamCipher as _};
use chacha20::XChaCha20;

const BASE_NONCE: [u8; 24] = [
    0x4d, 0x1f, 0x87, 0x2a, 0xc3, 0x5e, 0x90, 0x0b, 0x66, 0xd2, 0x39, 0xae, 0x71, 0x04, 0xbb,
    0x58, 0xe9, 0x12, 0x7c, 0xf5, 0x2d, 0xa0, 0x43, 0x9e,
];

pub struct StreamCipher {
    secret: [u8; 32],
}

impl StreamCipher {
    pub fn new(secret: &[u8; 32]) -> Self {
        Self { secret: *secret }
    }

    fn nonce(salt: [u8; 2]) -> [u8; 24] {
        let mut nonce = BASE_NONCE;
        for (i, b) in nonce.iter_mut().take(16).enumerate() {
            *b ^= salt[i % 2];
        }
        nonce
    }

    /// Encrypts or decrypts in place.
    pub fn apply(&self, buf: &mut [u8; 24]) {
        let nonce = Self::nonce([buf[0], buf[1]]);
        let mut cipher = XChaCha20::new(
            chacha20::Key::from_slice(&self.secret),
            chacha20::XNonce::from_slice(&nonce),
        );
        cipher.apply_keystream(&mut buf[2..]);
    }
}
