//! Ledger Transactor - nonce-synchronised transaction submission for EVM ledgers
//!
//! An [`Account`] serialises every write through one lock, keeps its cached
//! nonce in step with the ledger, refreshes its gas price from an oracle and
//! waits for inclusion, post-conditions and confirmations under a caller
//! supplied [`Deadline`].

pub mod account;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod retry;
pub mod tx;

pub use account::Account;
pub use error::{LedgerError, TransactorError, TransactorResult};
pub use retry::{BackoffPolicy, Deadline};
