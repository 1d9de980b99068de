//! Caller-supplied capabilities handed to the engine
//!
//! Pre/post conditions and the submit function are narrow single-method
//! traits. Plain closures returning futures implement them, so most callers
//! never name the traits.

use crate::error::{TransactorError, TransactorResult};
use crate::ledger::Ledger;
use crate::retry::Deadline;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, H256, U256};
use std::future::Future;
use tracing::debug;
use uuid::Uuid;

/// Boolean check evaluated by the engine before or after submission
#[async_trait]
pub trait Condition: Send + Sync {
    async fn check(&self) -> bool;
}

#[async_trait]
impl<F, Fut> Condition for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn check(&self) -> bool {
        self().await
    }
}

/// Builds, signs and broadcasts one transaction for the given snapshot
#[async_trait]
pub trait Submit: Send + Sync {
    async fn submit(&self, opts: TransactOpts) -> TransactorResult<H256>;
}

#[async_trait]
impl<F, Fut> Submit for F
where
    F: Fn(TransactOpts) -> Fut + Send + Sync,
    Fut: Future<Output = TransactorResult<H256>> + Send,
{
    async fn submit(&self, opts: TransactOpts) -> TransactorResult<H256> {
        self(opts).await
    }
}

/// Snapshot of the account for a single submission attempt
#[derive(Clone)]
pub struct TransactOpts {
    pub from: Address,
    pub nonce: u64,
    pub gas_price: U256,
    pub chain_id: u64,
    /// Identifies the attempt in logs
    pub attempt_id: Uuid,
    signer: LocalWallet,
    ledger: Ledger,
    deadline: Deadline,
}

impl TransactOpts {
    pub(crate) fn new(
        signer: LocalWallet,
        ledger: Ledger,
        nonce: u64,
        gas_price: U256,
        attempt_id: Uuid,
        deadline: Deadline,
    ) -> Self {
        Self {
            from: signer.address(),
            nonce,
            gas_price,
            chain_id: signer.chain_id(),
            attempt_id,
            signer,
            ledger,
            deadline,
        }
    }

    /// Read access to the ledger for payload builders
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Fill in nonce, gas price and chain id, sign with the account key and
    /// broadcast. A missing gas limit is estimated by the node.
    pub async fn send<T>(&self, tx: T) -> TransactorResult<H256>
    where
        T: Into<TypedTransaction> + Send,
    {
        let mut tx: TypedTransaction = tx.into();
        tx.set_from(self.from);
        tx.set_nonce(self.nonce);
        tx.set_gas_price(self.gas_price);
        tx.set_chain_id(self.chain_id);

        if tx.gas().is_none() {
            let gas = self
                .deadline
                .run(self.ledger.client().estimate_gas(&tx))
                .await??;
            tx.set_gas(gas);
        }

        let signature = self
            .signer
            .sign_transaction(&tx)
            .await
            .map_err(|e| TransactorError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = self.deadline.run(self.ledger.broadcast(raw)).await??;
        debug!(
            attempt = %self.attempt_id,
            nonce = self.nonce,
            "Broadcast transaction {:?}",
            tx_hash
        );
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockLedgerClient;
    use crate::retry::BackoffPolicy;
    use crate::tx::testing::TEST_KEY;
    use ethers::types::TransactionRequest;
    use ethers::utils::keccak256;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_signs_with_snapshot() {
        let signer = TEST_KEY.parse::<LocalWallet>().unwrap().with_chain_id(5u64);
        let mut client = MockLedgerClient::new();
        client
            .expect_send_raw_transaction()
            .times(1)
            .returning(|raw| Ok(H256::from(keccak256(&raw))));
        client.expect_estimate_gas().never();

        let opts = TransactOpts::new(
            signer.clone(),
            Ledger::new(Arc::new(client), BackoffPolicy::default()),
            11,
            U256::from(1_000_000_000u64),
            Uuid::new_v4(),
            Deadline::after(Duration::from_secs(5)),
        );
        assert_eq!(opts.from, signer.address());
        assert_eq!(opts.chain_id, 5);

        let request = TransactionRequest::new()
            .to(Address::repeat_byte(1))
            .value(100u64)
            .gas(21_000u64);
        let hash = opts.send(request).await.unwrap();
        assert_ne!(hash, H256::zero());
    }

    #[tokio::test]
    async fn test_send_estimates_missing_gas() {
        let signer = TEST_KEY.parse::<LocalWallet>().unwrap();
        let mut client = MockLedgerClient::new();
        client
            .expect_estimate_gas()
            .times(1)
            .returning(|_| Ok(U256::from(50_000u64)));
        client
            .expect_send_raw_transaction()
            .returning(|_| Err(crate::error::LedgerError::Rpc("nonce too low".into())));

        let opts = TransactOpts::new(
            signer,
            Ledger::new(Arc::new(client), BackoffPolicy::default()),
            0,
            U256::one(),
            Uuid::new_v4(),
            Deadline::after(Duration::from_secs(5)),
        );
        let err = opts
            .send(TransactionRequest::new().to(Address::repeat_byte(2)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nonce too low"));
    }

    #[tokio::test]
    async fn test_closures_are_conditions() {
        let yes = || async { true };
        let no = || async { false };
        let checks: [&dyn Condition; 2] = [&yes, &no];
        assert!(checks[0].check().await);
        assert!(!checks[1].check().await);
    }
}
