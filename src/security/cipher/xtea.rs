//! XTEA over three 8-byte blocks, used by v1 licences.

const DELTA: u32 = 0x9e37_79b9;

/// 32 cycles, i.e. 64 Feistel rounds.
const CYCLES: u32 = 32;

pub struct XteaCipher {
    k: [u32; 4],
}

impl XteaCipher {
    pub fn new(secret: &[u8; 16]) -> Self {
        let mut k = [0u32; 4];
        for (i, chunk) in secret.chunks_exact(4).enumerate() {
            k[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { k }
    }

    /// Salts bytes 2..24 with bytes 0..2, then encrypts each block.
    pub fn encrypt(&self, buf: &mut [u8; 24]) {
        salt(buf);
        for block in buf.chunks_exact_mut(8) {
            self.encrypt_block(block);
        }
    }

    pub fn decrypt(&self, buf: &mut [u8; 24]) {
        for block in buf.chunks_exact_mut(8) {
            self.decrypt_block(block);
        }
        salt(buf);
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let (mut v0, mut v1) = load(block);
        let mut sum: u32 = 0;
        for _ in 0..CYCLES {
            v0 = v0.wrapping_add(
                ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)
                    ^ sum.wrapping_add(self.k[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(DELTA);
            v1 = v1.wrapping_add(
                ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                    ^ sum.wrapping_add(self.k[((sum >> 11) & 3) as usize]),
            );
        }
        store(block, v0, v1);
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let (mut v0, mut v1) = load(block);
        let mut sum: u32 = DELTA.wrapping_mul(CYCLES);
        for _ in 0..CYCLES {
            v1 = v1.wrapping_sub(
                ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                    ^ sum.wrapping_add(self.k[((sum >> 11) & 3) as usize]),
            );
            sum = sum.wrapping_sub(DELTA);
            v0 = v0.wrapping_sub(
                ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)
                    ^ sum.wrapping_add(self.k[(sum & 3) as usize]),
            );
        }
        store(block, v0, v1);
    }
}

/// XOR is its own inverse, so the same pass salts and unsalts.
fn salt(buf: &mut [u8; 24]) {
    let (s0, s1) = (buf[0], buf[1]);
    for i in (2..24).step_by(2) {
        buf[i] ^= s0;
        buf[i + 1] ^= s1;
    }
}

#[inline]
fn load(block: &[u8]) -> (u32, u32) {
    (
        u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
        u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
    )
}

#[inline]
fn store(block: &mut [u8], v0: u32, v1: u32) {
    block[..4].copy_from_slice(&v0.to_be_bytes());
    block[4..8].copy_from_slice(&v1.to_be_bytes());
}
