//! Transaction submission module with nonce management and gas pricing

mod engine;
mod gas;
mod nonce;
mod state;
mod submit;

pub use engine::TransactionEngine;
pub use gas::{GasOracle, GasPricer, GasStationOracle, NodeGasOracle, SpeedTier};
pub use nonce::{NonceFault, NonceManager};
pub use state::TxState;
pub use submit::{Condition, Submit, TransactOpts};

#[cfg(test)]
pub(crate) mod testing {
    use super::gas::MockGasOracle;
    use crate::error::{LedgerError, TransactorError};
    use crate::ledger::{MockLedgerClient, Receipt};
    use ethers::signers::LocalWallet;

    pub const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    pub const GWEI: u64 = 1_000_000_000;

    pub fn signer() -> LocalWallet {
        TEST_KEY.parse().unwrap()
    }

    /// Broadcast rejection carrying a node message
    pub fn rejection(message: &str) -> TransactorError {
        LedgerError::Rpc(message.to_string()).into()
    }

    pub fn failing_oracle() -> MockGasOracle {
        let mut oracle = MockGasOracle::new();
        oracle
            .expect_price()
            .returning(|_| Err(TransactorError::GasOracle("unavailable".into())));
        oracle
    }

    pub fn fixed_oracle(price: u64) -> MockGasOracle {
        let mut oracle = MockGasOracle::new();
        oracle
            .expect_price()
            .returning(move |_| Ok(price.into()));
        oracle
    }

    /// Ledger that includes every transaction at `block` and reports `height`
    pub fn included_ledger(block: u64, height: u64) -> MockLedgerClient {
        let mut client = MockLedgerClient::new();
        client.expect_transaction_receipt().returning(move |tx_hash| {
            Ok(Some(Receipt {
                tx_hash,
                block_number: block,
                success: true,
            }))
        });
        client
            .expect_transaction_block()
            .returning(move |_| Ok(Some(block)));
        client.expect_block_number().returning(move || Ok(height));
        client
    }
}
