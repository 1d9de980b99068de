//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Classifying ledger rejections that concern the nonce
//! - Adjusting the local nonce and resubmitting within a fixed budget
//! - Resynchronising with the ledger's pending nonce

use super::state::TxState;
use super::submit::{Submit, TransactOpts};
use crate::config::EngineConfig;
use crate::error::{TransactorError, TransactorResult};
use crate::ledger::Ledger;
use crate::metrics;
use crate::retry::Deadline;

use ethers::types::{Address, H256};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a failed submission says about the nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceFault {
    /// The nonce was already consumed by another transaction of this account
    TooLow,
    /// The local nonce ran ahead of the ledger
    TooHigh,
    /// A competing transaction holds this nonce at an equal or higher price
    ReplacementUnderpriced,
    /// Some other complaint mentioning the nonce
    Other,
    /// The identical transaction is already in the node's pool
    AlreadyKnown,
    /// Not a nonce problem
    Unrelated,
}

impl NonceFault {
    pub fn classify(err: &TransactorError) -> Self {
        match err {
            TransactorError::NonceOutOfSync => return NonceFault::ReplacementUnderpriced,
            e if e.is_cancellation() => return NonceFault::Unrelated,
            _ => {}
        }

        let message = err.to_string().to_lowercase();
        if message.contains("already known") || message.contains(": known transaction") {
            NonceFault::AlreadyKnown
        } else if message.contains("replacement transaction underpriced")
            || message.contains("replacement underpriced")
        {
            NonceFault::ReplacementUnderpriced
        } else if message.contains("nonce too low") || message.contains("nonce is too low") {
            NonceFault::TooLow
        } else if message.contains("nonce too high") || message.contains("nonce is too high") {
            NonceFault::TooHigh
        } else if message.contains("nonce") {
            NonceFault::Other
        } else {
            NonceFault::Unrelated
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NonceFault::TooLow => "too_low",
            NonceFault::TooHigh => "too_high",
            NonceFault::ReplacementUnderpriced => "replacement_underpriced",
            NonceFault::Other => "other",
            NonceFault::AlreadyKnown => "already_known",
            NonceFault::Unrelated => "unrelated",
        }
    }
}

/// Keeps an account's cached nonce in step with the ledger
pub struct NonceManager {
    /// Account address
    address: Address,
    ledger: Ledger,
    /// Nonce-fault retries allowed per submission
    retry_budget: u32,
    /// Pause before re-reading the pending nonce
    retry_delay: Duration,
}

impl NonceManager {
    pub fn new(address: Address, ledger: Ledger, config: &EngineConfig) -> Self {
        Self {
            address,
            ledger,
            retry_budget: config.nonce_retry_budget,
            retry_delay: config.nonce_retry_delay(),
        }
    }

    /// Fetch the pending nonce from the ledger
    pub async fn fetch(&self, deadline: &Deadline) -> TransactorResult<u64> {
        self.ledger.pending_nonce(self.address, deadline).await
    }

    /// Wait `cool_down`, then overwrite the cached nonce with the ledger's
    /// pending nonce
    pub async fn resync(
        &self,
        state: &mut TxState,
        cool_down: Duration,
        deadline: &Deadline,
    ) -> TransactorResult<u64> {
        deadline.sleep(cool_down).await?;
        let nonce = self.fetch(deadline).await?;

        if nonce != state.nonce() {
            warn!(
                "Nonce for {:?} resynced from {} to {}",
                self.address,
                state.nonce(),
                nonce
            );
        }
        state.set_nonce(nonce);
        metrics::record_nonce(&self.address, nonce);
        Ok(nonce)
    }

    /// Submit through `submit`, correcting the nonce after each nonce fault
    ///
    /// `snapshot` produces the options for each try from the current state.
    /// The nonce is incremented exactly once per accepted broadcast.
    pub async fn submit<M>(
        &self,
        state: &mut TxState,
        submit: &dyn Submit,
        snapshot: M,
        deadline: &Deadline,
    ) -> TransactorResult<H256>
    where
        M: Fn(&TxState) -> TransactOpts,
    {
        let mut retries = 0u32;

        loop {
            deadline.check()?;

            let opts = snapshot(state);
            let attempt_id = opts.attempt_id;
            let nonce = opts.nonce;

            let err = match submit.submit(opts).await {
                Ok(tx_hash) => {
                    state.increment_nonce();
                    metrics::record_tx_submitted();
                    metrics::record_nonce(&self.address, state.nonce());
                    info!(
                        attempt = %attempt_id,
                        nonce,
                        "Transaction {:?} accepted by ledger",
                        tx_hash
                    );
                    return Ok(tx_hash);
                }
                Err(err) => err,
            };

            let fault = NonceFault::classify(&err);
            match fault {
                NonceFault::Unrelated | NonceFault::AlreadyKnown => return Err(err),
                NonceFault::ReplacementUnderpriced => {
                    warn!(attempt = %attempt_id, nonce, "Replacement underpriced: {}", err);
                    return Err(TransactorError::NonceOutOfSync);
                }
                _ if retries >= self.retry_budget => {
                    warn!(
                        attempt = %attempt_id,
                        "Nonce retry budget of {} exhausted: {}",
                        self.retry_budget,
                        err
                    );
                    return Err(err);
                }
                _ => {}
            }

            retries += 1;
            metrics::record_nonce_retry(fault.label());

            match fault {
                NonceFault::TooLow => {
                    debug!(attempt = %attempt_id, nonce, "Nonce too low, incrementing");
                    state.increment_nonce();
                }
                NonceFault::TooHigh => {
                    debug!(attempt = %attempt_id, nonce, "Nonce too high, decrementing");
                    state.decrement_nonce();
                }
                _ => {
                    debug!(attempt = %attempt_id, nonce, "Nonce error, refreshing: {}", err);
                    deadline.sleep(self.retry_delay).await?;
                    match deadline
                        .run(self.ledger.client().pending_nonce(self.address))
                        .await?
                    {
                        Ok(pending) => state.set_nonce(pending),
                        Err(e) => warn!("cannot refresh pending nonce = {}", e),
                    }
                }
            }
        }
    }
}
