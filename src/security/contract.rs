//! Contracts
//!
//! Every key belongs to a contract. The provider resolves contract ids to
//! contracts, which check key signatures, carry an administrative state and
//! accumulate usage counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::security::key::Key;
use crate::security::license::License;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractState {
    Allowed,
    Refused,
}

/// Message and byte counters of a contract.
#[derive(Debug, Default)]
pub struct Usage {
    ingress_messages: AtomicU64,
    ingress_bytes: AtomicU64,
    egress_messages: AtomicU64,
    egress_bytes: AtomicU64,
}

impl Usage {
    pub fn add_ingress(&self, bytes: usize) {
        self.ingress_messages.fetch_add(1, Ordering::Relaxed);
        self.ingress_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_egress(&self, bytes: usize) {
        self.egress_messages.fetch_add(1, Ordering::Relaxed);
        self.egress_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// (messages, bytes)
    pub fn ingress(&self) -> (u64, u64) {
        (
            self.ingress_messages.load(Ordering::Relaxed),
            self.ingress_bytes.load(Ordering::Relaxed),
        )
    }

    /// (messages, bytes)
    pub fn egress(&self) -> (u64, u64) {
        (
            self.egress_messages.load(Ordering::Relaxed),
            self.egress_bytes.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug)]
pub struct Contract {
    id: u32,
    signature: u32,
    refused: AtomicBool,
    usage: Usage,
}

impl Contract {
    pub fn new(id: u32, signature: u32) -> Self {
        Self {
            id,
            signature,
            refused: AtomicBool::new(false),
            usage: Usage::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The key was minted for this contract.
    pub fn validate(&self, key: &Key) -> bool {
        key.contract() == self.id && key.signature() == self.signature
    }

    pub fn state(&self) -> ContractState {
        if self.refused.load(Ordering::Acquire) {
            ContractState::Refused
        } else {
            ContractState::Allowed
        }
    }

    pub fn set_state(&self, state: ContractState) {
        self.refused
            .store(state == ContractState::Refused, Ordering::Release);
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }
}

pub trait ContractProvider: Send + Sync {
    fn get(&self, id: u32) -> Option<Arc<Contract>>;
}

/// Serves the one contract named by the licence.
pub struct SingleContractProvider {
    contract: Arc<Contract>,
}

impl SingleContractProvider {
    pub fn new(license: &License) -> Self {
        Self {
            contract: Arc::new(Contract::new(license.contract(), license.signature())),
        }
    }
}

impl ContractProvider for SingleContractProvider {
    fn get(&self, id: u32) -> Option<Arc<Contract>> {
        (self.contract.id == id).then(|| self.contract.clone())
    }
}
