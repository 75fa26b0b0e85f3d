use alloy::consensus::Transaction as TransactionTrait;
use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionResponse;
use alloy::primitives::B256;
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::Block;
use alloy::transports::{RpcError, TransportErrorKind};
use clonewatch_core::types::{ContractDeployment, CreationTx};
use futures_util::stream::{self, Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BlockFetchError {
    #[error("block {number} lookup failed: {source}")]
    Rpc {
        number: u64,
        #[source]
        source: RpcError<TransportErrorKind>,
    },
    #[error("block {0} not found")]
    Missing(u64),
}

#[derive(Debug, Error)]
pub enum ReceiptLookupError {
    #[error("receipt lookup for {hash} failed: {source}")]
    Rpc {
        hash: B256,
        #[source]
        source: RpcError<TransportErrorKind>,
    },
    #[error("no receipt for {0}")]
    Missing(B256),
    #[error("receipt for {0} carries no contract address")]
    NoContractAddress(B256),
}

#[derive(Clone)]
pub struct ContractDetector {
    provider: DynProvider,
}

impl ContractDetector {
    pub fn new(provider: DynProvider) -> Self {
        Self { provider }
    }

    /// Contract-creation transactions of `block`, in block order.
    pub fn creations(block: &Block, block_number: u64) -> Vec<CreationTx> {
        block
            .transactions
            .txns()
            .filter(|tx| TransactionTrait::kind(*tx).is_create())
            .map(|tx| CreationTx {
                hash: tx.tx_hash(),
                block_number,
            })
            .collect()
    }

    pub async fn fetch_block(&self, number: u64) -> Result<Block, BlockFetchError> {
        self.provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await
            .map_err(|source| BlockFetchError::Rpc { number, source })?
            .ok_or(BlockFetchError::Missing(number))
    }

    pub async fn resolve(&self, creation: CreationTx) -> Result<ContractDeployment, ReceiptLookupError> {
        let hash = creation.hash;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|source| ReceiptLookupError::Rpc { hash, source })?
            .ok_or(ReceiptLookupError::Missing(hash))?;
        let address = receipt
            .contract_address
            .ok_or(ReceiptLookupError::NoContractAddress(hash))?;
        Ok(ContractDeployment {
            address,
            tx_hash: hash,
            block_number: creation.block_number,
        })
    }

    /// Fetches block `number` and lazily resolves the deployment behind each
    /// creation, in transaction order. Receipts that cannot be resolved are
    /// logged and skipped.
    pub async fn find_deployments(
        &self,
        number: u64,
    ) -> Result<impl Stream<Item = ContractDeployment> + '_, BlockFetchError> {
        let block = self.fetch_block(number).await?;
        let creations = Self::creations(&block, number);
        debug!(
            block = number,
            txs = block.transactions.len(),
            creations = creations.len(),
            "scanned block"
        );
        Ok(stream::iter(creations).filter_map(move |creation| async move {
            match self.resolve(creation).await {
                Ok(deployment) => Some(deployment),
                Err(err) => {
                    warn!(block = number, tx = %creation.hash, %err, "skipping contract creation");
                    None
                }
            }
        }))
    }
}
