//! Licences
//!
//! A licence is `<base64url payload>:<version>`. The payload is the cipher
//! secret followed by the contract id and its signature (both big-endian).
//! Version 1 carries a 16-byte XTEA secret, version 3 a 32-byte XChaCha20
//! secret.

use std::fmt;
use std::str::FromStr;

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

use crate::security::cipher::{Cipher, StreamCipher, XteaCipher};
use crate::security::key::{perm, Key};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicenseError {
    /// Missing `:version` suffix
    Malformed,
    UnsupportedVersion(String),
    InvalidEncoding,
    InvalidLength(usize),
}

impl fmt::Display for LicenseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LicenseError::Malformed => write!(f, "licence must have the form <payload>:<version>"),
            LicenseError::UnsupportedVersion(v) => write!(f, "unsupported licence version '{}'", v),
            LicenseError::InvalidEncoding => write!(f, "licence payload is not valid base64url"),
            LicenseError::InvalidLength(n) => write!(f, "licence payload has invalid length {}", n),
        }
    }
}

impl std::error::Error for LicenseError {}

#[derive(Clone, PartialEq, Eq)]
enum Secret {
    V1([u8; 16]),
    V3([u8; 32]),
}

#[derive(Clone, PartialEq, Eq)]
pub struct License {
    secret: Secret,
    contract: u32,
    signature: u32,
}

impl License {
    /// Fresh v3 licence with random secret, contract and signature.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self {
            secret: Secret::V3(secret),
            contract: rng.next_u32(),
            signature: rng.next_u32(),
        }
    }

    pub fn v1(secret: [u8; 16], contract: u32, signature: u32) -> Self {
        Self {
            secret: Secret::V1(secret),
            contract,
            signature,
        }
    }

    pub fn v3(secret: [u8; 32], contract: u32, signature: u32) -> Self {
        Self {
            secret: Secret::V3(secret),
            contract,
            signature,
        }
    }

    pub fn version(&self) -> u8 {
        match self.secret {
            Secret::V1(_) => 1,
            Secret::V3(_) => 3,
        }
    }

    pub fn contract(&self) -> u32 {
        self.contract
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    pub fn cipher(&self) -> Cipher {
        match &self.secret {
            Secret::V1(s) => Cipher::Xtea(XteaCipher::new(s)),
            Secret::V3(s) => Cipher::Stream(StreamCipher::new(s)),
        }
    }

    /// Master key for this licence's contract. Master keys carry no target
    /// and never expire.
    pub fn new_master_key(&self, master_id: u16) -> Key {
        let mut key = Key::new();
        key.set_salt(rand::random());
        key.set_master(master_id);
        key.set_contract(self.contract);
        key.set_signature(self.signature);
        key.set_permissions(perm::MASTER);
        key
    }
}

impl FromStr for License {
    type Err = LicenseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (payload, version) = s.trim().rsplit_once(':').ok_or(LicenseError::Malformed)?;
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| LicenseError::InvalidEncoding)?;

        let secret_len = match version {
            "1" => 16,
            "3" => 32,
            other => return Err(LicenseError::UnsupportedVersion(other.to_string())),
        };
        if bytes.len() != secret_len + 8 {
            return Err(LicenseError::InvalidLength(bytes.len()));
        }

        let (secret, tail) = bytes.split_at(secret_len);
        let contract = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let signature = u32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]);

        let secret = match version {
            "1" => Secret::V1(secret.try_into().map_err(|_| LicenseError::InvalidLength(bytes.len()))?),
            _ => Secret::V3(secret.try_into().map_err(|_| LicenseError::InvalidLength(bytes.len()))?),
        };

        Ok(Self {
            secret,
            contract,
            signature,
        })
    }
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = match &self.secret {
            Secret::V1(s) => s.to_vec(),
            Secret::V3(s) => s.to_vec(),
        };
        bytes.extend_from_slice(&self.contract.to_be_bytes());
        bytes.extend_from_slice(&self.signature.to_be_bytes());
        write!(f, "{}:{}", BASE64_URL_SAFE_NO_PAD.encode(bytes), self.version())
    }
}

impl fmt::Debug for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("License")
            .field("version", &self.version())
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}
