//! Per-account nonce and gas price record
//!
//! The record is only ever touched while holding the account's lock, so the
//! methods here are plain synchronous mutations.

use ethers::types::U256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxState {
    /// Next nonce to use
    nonce: u64,
    /// Cached gas price in wei, always positive once set
    gas_price: U256,
}

impl TxState {
    pub fn new(nonce: u64, gas_price: U256) -> Self {
        Self { nonce, gas_price }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn gas_price(&self) -> U256 {
        self.gas_price
    }

    /// Called after every successful broadcast, and when the ledger says the
    /// nonce is already taken
    pub fn increment_nonce(&mut self) {
        self.nonce += 1;
    }

    pub fn decrement_nonce(&mut self) {
        self.nonce = self.nonce.saturating_sub(1);
    }

    /// Overwrite with the ledger's view
    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    /// Returns false, leaving the cached price untouched, for a zero price
    pub fn set_gas_price(&mut self, gas_price: U256) -> bool {
        if gas_price.is_zero() {
            return false;
        }
        self.gas_price = gas_price;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_never_underflows() {
        let mut state = TxState::new(0, U256::one());
        state.decrement_nonce();
        assert_eq!(state.nonce(), 0);
        state.increment_nonce();
        state.increment_nonce();
        assert_eq!(state.nonce(), 2);
    }

    #[test]
    fn test_zero_gas_price_is_rejected() {
        let mut state = TxState::new(0, U256::from(5));
        assert!(!state.set_gas_price(U256::zero()));
        assert_eq!(state.gas_price(), U256::from(5));
        assert!(state.set_gas_price(U256::from(9)));
        assert_eq!(state.gas_price(), U256::from(9));
    }
}
