use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

/// Last block handed off for processing. Persisted as `{"lastBlock": n}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "lastBlock")]
    pub last_block: u64,
}

impl Checkpoint {
    pub fn new(last_block: u64) -> Self {
        Self { last_block }
    }
}

/// A transaction without a destination, i.e. one that deploys code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationTx {
    pub hash: B256,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractDeployment {
    pub address: Address,
    pub tx_hash: B256,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBundle {
    pub address: Address,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertMessage {
    pub address: Address,
    pub percent: f64,
}
