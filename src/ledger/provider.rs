//! Ledger provider with multi-RPC support and automatic failover

use super::{LedgerClient, Receipt};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, TransactorError, TransactorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct RpcLedger {
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Configured chain id, skips the node query when set
    chain_id: Option<u64>,
}

impl RpcLedger {
    /// Create a new ledger provider
    pub fn new(config: &LedgerConfig) -> TransactorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(config.poll_interval_ms));
                    http_providers.push(provider);
                    debug!("Added HTTP provider: {}", url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TransactorError::Config("No valid RPC providers".to_string()));
        }

        Ok(Self {
            http_providers,
            current_provider: AtomicUsize::new(0),
            chain_id: config.chain_id,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Ledger failover to provider {}", next);
    }

    /// Run a read against each provider in turn until one answers
    async fn read<'a, T, F, Fut>(&'a self, what: &str, call: F) -> Result<T, LedgerError>
    where
        F: Fn(&'a Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match call(self.http()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Failed to read {}: {}", what, e);
                    last_error = Some(e.to_string());
                    self.failover();
                }
            }
        }

        Err(LedgerError::Rpc(
            last_error.unwrap_or_else(|| "All providers failed".to_string()),
        ))
    }
}

/// Narrow a quantity the node reports as 256 bits
fn to_u64(what: &str, value: U256) -> Result<u64, LedgerError> {
    u64::try_from(value)
        .map_err(|_| LedgerError::Malformed(format!("{} {} does not fit in 64 bits", what, value)))
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn chain_id(&self) -> Result<u64, LedgerError> {
        if let Some(chain_id) = self.chain_id {
            return Ok(chain_id);
        }
        let id = self.read("chain id", |p| p.get_chainid()).await?;
        to_u64("chain id", id)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, LedgerError> {
        let nonce = self
            .read("pending nonce", |p| {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
            })
            .await?;
        to_u64("pending nonce", nonce)
    }

    async fn balance(&self, address: Address) -> Result<U256, LedgerError> {
        self.read("balance", |p| p.get_balance(address, None)).await
    }

    async fn gas_price(&self) -> Result<U256, LedgerError> {
        self.read("gas price", |p| p.get_gas_price()).await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, LedgerError> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, LedgerError> {
        // No failover here: a rejection must reach the engine untouched
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, LedgerError> {
        let receipt = self
            .read("transaction receipt", |p| p.get_transaction_receipt(tx_hash))
            .await?;

        Ok(receipt.and_then(|r| {
            r.block_number.map(|block| Receipt {
                tx_hash: r.transaction_hash,
                block_number: block.as_u64(),
                success: r.status == Some(1.into()),
            })
        }))
    }

    async fn transaction_block(&self, tx_hash: H256) -> Result<Option<u64>, LedgerError> {
        let tx = self
            .read("transaction", |p| p.get_transaction(tx_hash))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {:?}", tx_hash)))?;
        Ok(tx.block_number.map(|b| b.as_u64()))
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        let block = self.read("block number", |p| p.get_block_number()).await?;
        Ok(block.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config(urls: &[&str]) -> LedgerConfig {
        LedgerConfig {
            rpc_urls: urls.iter().map(|u| u.to_string()).collect(),
            chain_id: Some(5),
            poll_interval_ms: 100,
        }
    }

    /// Body of one HTTP request
    async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return Vec::new();
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                let body = end + 4;
                if buf.len() >= body + length {
                    return buf[body..body + length].to_vec();
                }
            }
        }
    }

    /// JSON-RPC node answering every request with `result`
    async fn stub_node(result: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let request = read_request(&mut stream).await;
                let id = serde_json::from_slice::<serde_json::Value>(&request)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or_else(|| 1.into());
                let reply =
                    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    reply.len(),
                    reply
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_wide_quantities_are_malformed() {
        assert_eq!(to_u64("nonce", U256::from(42)), Ok(42));
        assert_eq!(to_u64("nonce", U256::from(u64::MAX)), Ok(u64::MAX));
        assert!(matches!(
            to_u64("nonce", U256::from(u64::MAX) + U256::one()),
            Err(LedgerError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_pending_nonce_is_malformed() {
        let url = stub_node("0x10000000000000000").await;
        let ledger = RpcLedger::new(&config(&[&url])).unwrap();

        let result = ledger.pending_nonce(Address::repeat_byte(1)).await;
        assert!(matches!(result, Err(LedgerError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_oversized_chain_id_is_malformed() {
        let url = stub_node("0x10000000000000000").await;
        let mut config = config(&[&url]);
        config.chain_id = None;
        let ledger = RpcLedger::new(&config).unwrap();

        assert!(matches!(
            ledger.chain_id().await,
            Err(LedgerError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_nonce_read_from_node() {
        let url = stub_node("0x2a").await;
        let ledger = RpcLedger::new(&config(&[&url])).unwrap();

        assert_eq!(ledger.pending_nonce(Address::repeat_byte(1)).await, Ok(42));
    }

    #[test]
    fn test_rejects_empty_provider_list() {
        assert!(matches!(
            RpcLedger::new(&config(&[])),
            Err(TransactorError::Config(_))
        ));
    }

    #[test]
    fn test_failover_cycles_through_providers() {
        let ledger = RpcLedger::new(&config(&["http://a.invalid:8545", "http://b.invalid:8545"]))
            .unwrap();
        assert_eq!(ledger.current_provider.load(Ordering::Relaxed), 0);
        ledger.failover();
        assert_eq!(ledger.current_provider.load(Ordering::Relaxed), 1);
        ledger.failover();
        assert_eq!(ledger.current_provider.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_configured_chain_id_skips_node() {
        let ledger = RpcLedger::new(&config(&["http://a.invalid:8545"])).unwrap();
        assert_eq!(ledger.chain_id().await.unwrap(), 5);
    }
}
