//! Account facade: the entry point for callers that send transactions
//!
//! An [`Account`] owns one signing key and one [`TransactionEngine`]. ERC20
//! helpers and CLI tools build on [`Account::transact`]; native value
//! transfers are provided directly.

use crate::config::{EngineConfig, Settings};
use crate::error::{TransactorError, TransactorResult};
use crate::ledger::{Ledger, LedgerClient, Receipt, RpcLedger};
use crate::retry::Deadline;
use crate::tx::{
    Condition, GasOracle, GasStationOracle, NodeGasOracle, SpeedTier, Submit, TransactOpts,
    TransactionEngine,
};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, TransactionRequest, H256, U256};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Gas limit of a plain value transfer
pub const TRANSFER_GAS: u64 = 21_000;

pub struct Account {
    engine: TransactionEngine,
}

impl Account {
    /// Build an account from loaded settings, reading the key from the
    /// configured environment variable
    pub async fn from_settings(settings: &Settings) -> TransactorResult<Self> {
        let key_var = &settings.wallet.private_key_env;
        let key = env::var(key_var).map_err(|_| {
            TransactorError::Config(format!("environment variable {} is not set", key_var))
        })?;
        let signer: LocalWallet = key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| TransactorError::Wallet(format!("invalid private key: {}", e)))?;

        let client: Arc<dyn LedgerClient> = Arc::new(RpcLedger::new(&settings.ledger)?);
        let oracle: Arc<dyn GasOracle> = if settings.gas_oracle.url.is_empty() {
            Arc::new(NodeGasOracle::new(client.clone()))
        } else {
            Arc::new(GasStationOracle::new(&settings.gas_oracle)?)
        };

        Self::new(
            signer,
            client,
            oracle,
            settings.gas_oracle.tier,
            settings.engine.clone(),
        )
        .await
    }

    pub async fn new(
        signer: LocalWallet,
        client: Arc<dyn LedgerClient>,
        oracle: Arc<dyn GasOracle>,
        tier: SpeedTier,
        config: EngineConfig,
    ) -> TransactorResult<Self> {
        let ledger = Ledger::new(client, config.backoff);
        let engine = TransactionEngine::new(signer, ledger, oracle, tier, config).await?;
        Ok(Self { engine })
    }

    pub fn address(&self) -> Address {
        self.engine.address()
    }

    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    /// See [`TransactionEngine::transact`]
    pub async fn transact(
        &self,
        pre_condition: Option<&dyn Condition>,
        submit: &dyn Submit,
        post_condition: Option<&dyn Condition>,
        confirm_blocks: u64,
        deadline: &Deadline,
    ) -> TransactorResult<Receipt> {
        self.engine
            .transact(pre_condition, submit, post_condition, confirm_blocks, deadline)
            .await
    }

    /// Transfer native value to `to`
    ///
    /// With `send_all` the value is the whole balance minus the fee, computed
    /// at submission time, and `value` is ignored. `gas_price` overrides the
    /// cached price for this transfer only.
    pub async fn transfer(
        &self,
        to: Address,
        value: U256,
        gas_price: Option<U256>,
        confirm_blocks: u64,
        send_all: bool,
        deadline: &Deadline,
    ) -> TransactorResult<Receipt> {
        let from = self.address();
        let client = self.engine.ledger().client().clone();

        let pre_condition = move || {
            let client = client.clone();
            async move {
                match client.balance(from).await {
                    Ok(balance) if send_all => !balance.is_zero(),
                    Ok(balance) => balance >= value,
                    Err(e) => {
                        warn!("Failed to read balance of {:?}: {}", from, e);
                        false
                    }
                }
            }
        };

        let submit = move |mut opts: TransactOpts| async move {
            if let Some(price) = gas_price {
                opts.gas_price = price;
            }

            let value = if send_all {
                let balance = opts.ledger().balance(opts.from, opts.deadline()).await?;
                let fee = opts.gas_price.saturating_mul(U256::from(TRANSFER_GAS));
                if balance <= fee {
                    return Err(TransactorError::InsufficientBalance {
                        have: balance,
                        need: fee,
                    });
                }
                balance - fee
            } else {
                value
            };

            info!(nonce = opts.nonce, "Transferring {} wei to {:?}", value, to);
            opts.send(TransactionRequest::new().to(to).value(value).gas(TRANSFER_GAS))
                .await
        };

        self.transact(Some(&pre_condition), &submit, None, confirm_blocks, deadline)
            .await
    }

    /// Sign a 32-byte digest with the account key
    pub fn sign(&self, digest: H256) -> TransactorResult<Signature> {
        self.engine
            .signer()
            .sign_hash(digest)
            .map_err(|e| TransactorError::Wallet(e.to_string()))
    }

    pub async fn balance(&self, deadline: &Deadline) -> TransactorResult<U256> {
        self.engine.ledger().balance(self.address(), deadline).await
    }

    pub async fn gas_price(&self) -> U256 {
        self.engine.gas_price().await
    }

    pub async fn set_gas_price(&self, gas_price: U256) -> TransactorResult<()> {
        self.engine.set_gas_price(gas_price).await
    }

    pub async fn nonce(&self) -> u64 {
        self.engine.nonce().await
    }

    pub async fn resync_nonce(
        &self,
        cool_down: Duration,
        deadline: &Deadline,
    ) -> TransactorResult<u64> {
        self.engine.resync_nonce(cool_down, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockLedgerClient;
    use crate::tx::testing::{fixed_oracle, included_ledger, signer, GWEI};
    use ethers::types::{Bytes, Transaction};
    use ethers::utils::{keccak256, parse_ether, rlp};
    use std::sync::Mutex;

    async fn account(mut client: MockLedgerClient) -> Account {
        client.expect_chain_id().returning(|| Ok(1));
        client.expect_pending_nonce().returning(|_| Ok(4));
        Account::new(
            signer(),
            Arc::new(client),
            Arc::new(fixed_oracle(2 * GWEI)),
            SpeedTier::Fast,
            EngineConfig::default(),
        )
        .await
        .unwrap()
    }

    fn capture(client: &mut MockLedgerClient) -> Arc<Mutex<Vec<Bytes>>> {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        client.expect_send_raw_transaction().returning(move |raw| {
            let hash = H256::from(keccak256(&raw));
            log.lock().unwrap().push(raw);
            Ok(hash)
        });
        sent
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(120))
    }

    #[tokio::test]
    async fn test_transfer_builds_value_transaction() {
        let mut client = included_ledger(7, 7);
        client
            .expect_balance()
            .returning(|_| Ok(parse_ether(2).unwrap()));
        let sent = capture(&mut client);
        let account = account(client).await;

        let to = Address::repeat_byte(0x42);
        let receipt = account
            .transfer(to, parse_ether(1).unwrap(), None, 0, false, &deadline())
            .await
            .unwrap();

        assert_eq!(receipt.block_number, 7);
        assert_eq!(account.nonce().await, 5);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let tx: Transaction = rlp::decode(&sent[0]).unwrap();
        assert_eq!(tx.to, Some(to));
        assert_eq!(tx.value, parse_ether(1).unwrap());
        assert_eq!(tx.gas, U256::from(TRANSFER_GAS));
        assert_eq!(tx.nonce, U256::from(4));
        assert_eq!(tx.gas_price, Some(U256::from(2 * GWEI)));
        assert_eq!(tx.recover_from().unwrap(), account.address());
    }

    #[tokio::test]
    async fn test_transfer_requires_balance() {
        let mut client = MockLedgerClient::new();
        client.expect_balance().returning(|_| Ok(U256::from(10)));
        client.expect_send_raw_transaction().never();
        let account = account(client).await;

        let result = account
            .transfer(Address::zero(), U256::from(11), None, 0, false, &deadline())
            .await;

        assert!(matches!(result, Err(TransactorError::PreConditionFailed)));
        assert_eq!(account.nonce().await, 4);
    }

    #[tokio::test]
    async fn test_send_all_subtracts_fee_at_submission() {
        let mut client = included_ledger(2, 2);
        client
            .expect_balance()
            .returning(|_| Ok(parse_ether(1).unwrap()));
        let sent = capture(&mut client);
        let account = account(client).await;

        let price = U256::from(10 * GWEI);
        account
            .transfer(Address::repeat_byte(1), U256::zero(), Some(price), 0, true, &deadline())
            .await
            .unwrap();

        let tx: Transaction = rlp::decode(&sent.lock().unwrap()[0]).unwrap();
        assert_eq!(tx.gas_price, Some(price));
        assert_eq!(tx.value, parse_ether(1).unwrap() - price * U256::from(TRANSFER_GAS));
    }

    #[tokio::test]
    async fn test_send_all_below_fee_is_insufficient() {
        let mut client = MockLedgerClient::new();
        client.expect_balance().returning(|_| Ok(U256::from(1_000)));
        client.expect_send_raw_transaction().never();
        let account = account(client).await;

        let result = account
            .transfer(Address::repeat_byte(1), U256::zero(), None, 0, true, &deadline())
            .await;

        assert!(matches!(
            result,
            Err(TransactorError::InsufficientBalance { .. })
        ));
    }

    #[tokio::test]
    async fn test_sign_recovers_to_address() {
        let account = account(MockLedgerClient::new()).await;
        let digest = H256::from(keccak256(b"settlement"));

        let signature = account.sign(digest).unwrap();
        assert_eq!(signature.recover(digest).unwrap(), account.address());
    }

    #[tokio::test]
    async fn test_missing_key_variable_is_config_error() {
        let settings: Settings = toml::from_str(
            r#"
            [ledger]
            rpc_urls = ["http://127.0.0.1:8545"]

            [gas_oracle]
            url = ""

            [wallet]
            private_key_env = "TRANSACTOR_TEST_MISSING_KEY"
            "#,
        )
        .unwrap();

        let result = Account::from_settings(&settings).await;
        assert!(matches!(result, Err(TransactorError::Config(_))));
    }
}
