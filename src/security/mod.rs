//! Admission control: channels, capability keys, ciphers, licences and
//! contracts.

pub mod channel;
pub mod cipher;
pub mod contract;
pub mod key;
pub mod license;

pub use channel::{Channel, ChannelKind};
pub use cipher::{Cipher, CipherError};
pub use contract::{Contract, ContractProvider, ContractState, SingleContractProvider};
pub use key::{perm, Key, KeyError};
pub use license::{License, LicenseError};
