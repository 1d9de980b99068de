//! Transaction engine: pre-condition, nonce-aware submission, inclusion,
//! post-condition and confirmation waiting for one account

use super::gas::{GasOracle, GasPricer, SpeedTier};
use super::nonce::{NonceFault, NonceManager};
use super::state::TxState;
use super::submit::{Condition, Submit, TransactOpts};
use crate::config::EngineConfig;
use crate::error::{TransactorError, TransactorResult};
use crate::ledger::{Ledger, Receipt};
use crate::metrics;
use crate::retry::{poll_until, BackoffPolicy, Deadline};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Broadcasts of one operation competing for the same nonce
struct InFlight {
    nonce: u64,
    tx_hashes: Vec<H256>,
    latest: H256,
    /// The ledger reported the nonce as already consumed
    slot_taken: bool,
}

impl InFlight {
    fn new(nonce: u64, tx_hash: H256) -> Self {
        Self {
            nonce,
            tx_hashes: vec![tx_hash],
            latest: tx_hash,
            slot_taken: false,
        }
    }

    fn push(&mut self, tx_hash: H256) {
        if !self.tx_hashes.contains(&tx_hash) {
            self.tx_hashes.push(tx_hash);
        }
        self.latest = tx_hash;
    }
}

/// Serialises an account's transactions against its nonce
///
/// Every submission holds the state lock from gas refresh through inclusion,
/// so concurrent callers on one engine queue behind each other. Engines for
/// different keys share nothing.
pub struct TransactionEngine {
    /// Signing key, bound to the ledger's chain id
    signer: LocalWallet,
    ledger: Ledger,
    nonces: NonceManager,
    gas: GasPricer,
    state: Mutex<TxState>,
    config: EngineConfig,
}

impl TransactionEngine {
    /// Create an engine, reading chain id, pending nonce and an initial gas
    /// price from the ledger and oracle
    pub async fn new(
        signer: LocalWallet,
        ledger: Ledger,
        oracle: Arc<dyn GasOracle>,
        tier: SpeedTier,
        config: EngineConfig,
    ) -> TransactorResult<Self> {
        let deadline = Deadline::after(config.init_timeout());

        let chain_id = ledger.chain_id(&deadline).await?;
        let signer = signer.with_chain_id(chain_id);
        let nonce = ledger.pending_nonce(signer.address(), &deadline).await?;

        let gas = GasPricer::new(oracle, tier);
        let gas_price = match deadline.run(gas.recommend()).await? {
            Ok(price) if !price.is_zero() => price,
            Ok(_) => ledger.gas_price(&deadline).await?,
            Err(e) => {
                warn!("cannot update gas price = {}, using node price", e);
                ledger.gas_price(&deadline).await?
            }
        };

        info!(
            "Engine for {:?} on chain {} starts at nonce {} with gas price {}",
            signer.address(),
            chain_id,
            nonce,
            gas_price
        );

        Ok(Self::from_parts(
            signer,
            ledger,
            gas,
            TxState::new(nonce, gas_price),
            config,
        ))
    }

    /// Assemble an engine from known state without touching the ledger
    pub fn from_parts(
        signer: LocalWallet,
        ledger: Ledger,
        gas: GasPricer,
        state: TxState,
        config: EngineConfig,
    ) -> Self {
        let nonces = NonceManager::new(signer.address(), ledger.clone(), &config);
        metrics::record_nonce(&signer.address(), state.nonce());
        metrics::record_gas_price(&signer.address(), state.gas_price());

        Self {
            signer,
            ledger,
            nonces,
            gas,
            state: Mutex::new(state),
            config,
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.signer.chain_id()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub(crate) fn signer(&self) -> &LocalWallet {
        &self.signer
    }

    /// Next nonce this engine will use
    pub async fn nonce(&self) -> u64 {
        self.state.lock().await.nonce()
    }

    /// Cached gas price
    pub async fn gas_price(&self) -> U256 {
        self.state.lock().await.gas_price()
    }

    /// Pin the cached gas price until the next successful oracle refresh
    pub async fn set_gas_price(&self, gas_price: U256) -> TransactorResult<()> {
        let mut state = self.state.lock().await;
        if !state.set_gas_price(gas_price) {
            return Err(TransactorError::InvalidGasPrice);
        }
        metrics::record_gas_price(&self.address(), gas_price);
        Ok(())
    }

    /// Wait `cool_down`, then replace the cached nonce with the ledger's
    /// pending nonce. Queues behind in-flight submissions.
    pub async fn resync_nonce(
        &self,
        cool_down: Duration,
        deadline: &Deadline,
    ) -> TransactorResult<u64> {
        let mut state = deadline.run(self.state.lock()).await?;
        self.nonces.resync(&mut state, cool_down, deadline).await
    }

    /// Perform a write operation
    ///
    /// Fails immediately with `PreConditionFailed` if `pre_condition` is false.
    /// Otherwise submits until one broadcast is included, polls
    /// `post_condition` until it holds, and waits for `confirm_blocks` blocks
    /// on top of the inclusion block. Stops early with `NonceOutOfSync` on a
    /// replacement-underpriced rejection.
    pub async fn transact(
        &self,
        pre_condition: Option<&dyn Condition>,
        submit: &dyn Submit,
        post_condition: Option<&dyn Condition>,
        confirm_blocks: u64,
        deadline: &Deadline,
    ) -> TransactorResult<Receipt> {
        let started = Instant::now();
        let result = self
            .execute(pre_condition, submit, post_condition, confirm_blocks, deadline)
            .await;

        match &result {
            Ok(_) => metrics::record_tx_confirmed(started.elapsed()),
            Err(e) => {
                warn!("Transaction from {:?} failed: {}", self.address(), e);
                metrics::record_tx_failed(e.reason());
            }
        }
        result
    }

    async fn execute(
        &self,
        pre_condition: Option<&dyn Condition>,
        submit: &dyn Submit,
        post_condition: Option<&dyn Condition>,
        confirm_blocks: u64,
        deadline: &Deadline,
    ) -> TransactorResult<Receipt> {
        if let Some(check) = pre_condition {
            if !deadline.run(check.check()).await? {
                return Err(TransactorError::PreConditionFailed);
            }
        }

        let receipt = self.submit_until_included(submit, deadline).await?;

        if let Some(check) = post_condition {
            self.await_post_condition(check, deadline).await?;
        }

        self.await_confirmations(receipt.tx_hash, confirm_blocks, deadline)
            .await?;
        Ok(receipt)
    }

    /// Retry whole attempts until one broadcast is included
    ///
    /// Once a broadcast has been accepted, later attempts reuse its nonce so
    /// that at most one transaction of this operation can be mined.
    async fn submit_until_included(
        &self,
        submit: &dyn Submit,
        deadline: &Deadline,
    ) -> TransactorResult<Receipt> {
        let mut delays = self.config.backoff.delays();
        let mut in_flight = None;

        loop {
            deadline.check()?;

            match self.attempt(submit, &mut in_flight, deadline).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_cancellation() => {
                    deadline.check()?;
                    warn!("Transaction attempt interrupted, retrying: {}", e);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => warn!("Transaction attempt failed, retrying: {}", e),
            }

            deadline.sleep(delays.next_delay()).await?;
        }
    }

    /// One attempt under the lock: refresh gas, broadcast, wait for inclusion
    async fn attempt(
        &self,
        submit: &dyn Submit,
        in_flight: &mut Option<InFlight>,
        deadline: &Deadline,
    ) -> TransactorResult<Receipt> {
        let mut state = deadline.run(self.state.lock()).await?;

        if deadline.run(self.gas.refresh(&mut state)).await? {
            metrics::record_gas_price(&self.address(), state.gas_price());
        }

        let flight = match in_flight {
            Some(flight) => {
                if let Some(receipt) = deadline.run(self.ledger.find_receipt(&flight.tx_hashes)).await? {
                    return Ok(self.included(receipt));
                }
                self.resubmit(&state, flight, submit, deadline).await?;
                flight
            }
            None => {
                let tx_hash = self
                    .nonces
                    .submit(
                        &mut state,
                        submit,
                        |s| self.snapshot(s.nonce(), s.gas_price(), deadline),
                        deadline,
                    )
                    .await?;
                in_flight.insert(InFlight::new(state.nonce().saturating_sub(1), tx_hash))
            }
        };

        let inclusion = deadline.child(self.config.inclusion_timeout());
        match self.ledger.wait_included(&flight.tx_hashes, &inclusion).await {
            Ok(receipt) => Ok(self.included(receipt)),
            Err(TransactorError::DeadlineExceeded) if deadline.check().is_ok() => {
                if flight.slot_taken {
                    warn!(
                        "Nonce {} consumed by a transaction this operation did not send",
                        flight.nonce
                    );
                    return Err(TransactorError::NonceOutOfSync);
                }
                Err(TransactorError::InclusionTimeout {
                    tx_hash: flight.latest,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Broadcast again at the nonce this operation already holds
    async fn resubmit(
        &self,
        state: &TxState,
        flight: &mut InFlight,
        submit: &dyn Submit,
        deadline: &Deadline,
    ) -> TransactorResult<()> {
        let opts = self.snapshot(flight.nonce, state.gas_price(), deadline);
        let attempt_id = opts.attempt_id;

        let err = match submit.submit(opts).await {
            Ok(tx_hash) => {
                metrics::record_tx_submitted();
                info!(
                    attempt = %attempt_id,
                    nonce = flight.nonce,
                    "Replacement {:?} accepted by ledger",
                    tx_hash
                );
                flight.push(tx_hash);
                return Ok(());
            }
            Err(err) => err,
        };

        match NonceFault::classify(&err) {
            NonceFault::AlreadyKnown => {
                debug!(attempt = %attempt_id, nonce = flight.nonce, "Broadcast already pooled");
                Ok(())
            }
            NonceFault::TooLow => {
                debug!(
                    attempt = %attempt_id,
                    nonce = flight.nonce,
                    "Nonce consumed, waiting for earlier broadcasts"
                );
                flight.slot_taken = true;
                Ok(())
            }
            NonceFault::ReplacementUnderpriced => {
                warn!(attempt = %attempt_id, nonce = flight.nonce, "Replacement underpriced: {}", err);
                Err(TransactorError::NonceOutOfSync)
            }
            _ => Err(err),
        }
    }

    fn included(&self, receipt: Receipt) -> Receipt {
        if receipt.success {
            info!(
                "Transaction {:?} included in block {}",
                receipt.tx_hash, receipt.block_number
            );
        } else {
            warn!(
                "Transaction {:?} reverted in block {}",
                receipt.tx_hash, receipt.block_number
            );
        }
        receipt
    }

    fn snapshot(&self, nonce: u64, gas_price: U256, deadline: &Deadline) -> TransactOpts {
        TransactOpts::new(
            self.signer.clone(),
            self.ledger.clone(),
            nonce,
            gas_price,
            Uuid::new_v4(),
            deadline.clone(),
        )
    }

    async fn await_post_condition(
        &self,
        check: &dyn Condition,
        deadline: &Deadline,
    ) -> TransactorResult<()> {
        poll_until(deadline, &self.config.backoff, || async move {
            check.check().await.then_some(())
        })
        .await
        .map_err(|e| {
            if e.is_cancellation() {
                TransactorError::PostConditionFailed
            } else {
                e
            }
        })
    }

    async fn await_confirmations(
        &self,
        tx_hash: H256,
        confirm_blocks: u64,
        deadline: &Deadline,
    ) -> TransactorResult<()> {
        let included_at = self.ledger.block_number_of(tx_hash, deadline).await?;
        let target = included_at.saturating_add(confirm_blocks);
        let client = self.ledger.client();

        let height = poll_until(
            deadline,
            &BackoffPolicy::fixed(self.config.confirmation_poll()),
            || async move {
                match client.block_number().await {
                    Ok(height) if height >= target => Some(height),
                    Ok(height) => {
                        debug!(
                            "Transaction {:?} at {} of {} confirmations",
                            tx_hash,
                            height.saturating_sub(included_at),
                            confirm_blocks
                        );
                        None
                    }
                    Err(e) => {
                        warn!("Failed to read block height: {}", e);
                        None
                    }
                }
            },
        )
        .await?;

        info!(
            "Transaction {:?} confirmed: included at {}, height {}",
            tx_hash, included_at, height
        );
        Ok(())
    }
}
