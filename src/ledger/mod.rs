//! Ledger module - the engine's view of the remote node
//!
//! This module provides:
//! - The [`LedgerClient`] trait: single-shot node calls that may fail
//! - The [`Ledger`] façade: the same calls retried with exponential backoff
//!   until they succeed or the caller's deadline fires
//! - An ethers-backed RPC implementation with multi-URL failover

pub mod provider;

pub use provider::RpcLedger;

use crate::error::{LedgerError, TransactorResult};
use crate::retry::{poll_until, BackoffPolicy, Deadline};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
#[cfg(test)]
use mockall::automock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Inclusion record of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    /// Whether execution succeeded (a reverted transaction still consumes its
    /// nonce)
    pub success: bool,
}

/// Raw calls against the ledger node. Every call is a single attempt.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Chain id used for replay-protected signing
    async fn chain_id(&self) -> Result<u64, LedgerError>;

    /// Nonce of the next transaction, counting pending ones
    async fn pending_nonce(&self, address: Address) -> Result<u64, LedgerError>;

    /// Balance at the latest block
    async fn balance(&self, address: Address) -> Result<U256, LedgerError>;

    /// Node-suggested gas price
    async fn gas_price(&self) -> Result<U256, LedgerError>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, LedgerError>;

    /// Submit a signed, RLP-encoded transaction
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, LedgerError>;

    /// Receipt of a transaction, `None` while it is still pending
    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, LedgerError>;

    /// Block containing a transaction, `None` while it is still pending.
    /// `NotFound` when the node does not know the transaction.
    async fn transaction_block(&self, tx_hash: H256) -> Result<Option<u64>, LedgerError>;

    /// Current block height
    async fn block_number(&self) -> Result<u64, LedgerError>;
}

/// Retrying façade over a [`LedgerClient`]
///
/// Read calls are retried with the configured backoff until they succeed or
/// the supplied deadline fires. Broadcasts are never retried here: their
/// failures carry nonce information the engine has to classify.
#[derive(Clone)]
pub struct Ledger {
    client: Arc<dyn LedgerClient>,
    backoff: BackoffPolicy,
}

impl Ledger {
    pub fn new(client: Arc<dyn LedgerClient>, backoff: BackoffPolicy) -> Self {
        Self { client, backoff }
    }

    /// Underlying single-shot client
    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        &self.client
    }

    pub async fn chain_id(&self, deadline: &Deadline) -> TransactorResult<u64> {
        self.retry("chain id", deadline, || self.client.chain_id())
            .await
    }

    pub async fn pending_nonce(
        &self,
        address: Address,
        deadline: &Deadline,
    ) -> TransactorResult<u64> {
        self.retry("pending nonce", deadline, || {
            self.client.pending_nonce(address)
        })
        .await
    }

    pub async fn balance(&self, address: Address, deadline: &Deadline) -> TransactorResult<U256> {
        self.retry("balance", deadline, || self.client.balance(address))
            .await
    }

    pub async fn gas_price(&self, deadline: &Deadline) -> TransactorResult<U256> {
        self.retry("gas price", deadline, || self.client.gas_price())
            .await
    }

    /// Single broadcast attempt
    pub async fn broadcast(&self, raw: Bytes) -> Result<H256, LedgerError> {
        self.client.send_raw_transaction(raw).await
    }

    /// First receipt found among `tx_hashes`, reading each once
    pub async fn find_receipt(&self, tx_hashes: &[H256]) -> Option<Receipt> {
        for &tx_hash in tx_hashes {
            match self.client.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => debug!("Transaction {:?} not yet included", tx_hash),
                Err(e) => warn!("Failed to read receipt of {:?}: {}", tx_hash, e),
            }
        }
        None
    }

    /// Wait until one of `tx_hashes` has a receipt. Several hashes arise when
    /// a broadcast was replaced at the same nonce.
    pub async fn wait_included(
        &self,
        tx_hashes: &[H256],
        deadline: &Deadline,
    ) -> TransactorResult<Receipt> {
        poll_until(deadline, &self.backoff, || self.find_receipt(tx_hashes)).await
    }

    /// Block number containing `tx_hash`, waiting while it is pending
    pub async fn block_number_of(
        &self,
        tx_hash: H256,
        deadline: &Deadline,
    ) -> TransactorResult<u64> {
        poll_until(deadline, &self.backoff, || async move {
            match self.client.transaction_block(tx_hash).await {
                Ok(block) => block,
                Err(LedgerError::NotFound(what)) => {
                    debug!("{} not visible to the node yet", what);
                    None
                }
                Err(e) => {
                    warn!("Failed to read block of {:?}: {}", tx_hash, e);
                    None
                }
            }
        })
        .await
    }

    async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        deadline: &Deadline,
        mut call: F,
    ) -> TransactorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        poll_until(deadline, &self.backoff, || {
            let fut = call();
            async move {
                match fut.await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!("Ledger {} failed, retrying: {}", operation, e);
                        None
                    }
                }
            }
        })
        .await
    }
}
