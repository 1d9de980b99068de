//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction outcomes and latency
//! - Nonce retries by fault kind
//! - Cached nonce and gas price per account

use crate::error::{TransactorError, TransactorResult};

use ethers::types::{Address, U256};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram, register_int_counter,
    CounterVec, Encoder, GaugeVec, Histogram, IntCounter, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    // Transaction metrics
    pub static ref TX_SUBMITTED: IntCounter = register_int_counter!(
        "transactor_transactions_submitted_total",
        "Total broadcasts accepted by the ledger"
    ).unwrap();

    pub static ref TX_CONFIRMED: IntCounter = register_int_counter!(
        "transactor_transactions_confirmed_total",
        "Total transactions included and confirmed"
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "transactor_transactions_failed_total",
        "Total failed transactions by reason",
        &["reason"]
    ).unwrap();

    pub static ref TX_LATENCY: Histogram = register_histogram!(
        "transactor_transaction_latency_seconds",
        "Time from pre-condition to final confirmation",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCE_RETRIES: CounterVec = register_counter_vec!(
        "transactor_nonce_retries_total",
        "Total resubmissions after a nonce fault",
        &["fault"]
    ).unwrap();

    pub static ref ACCOUNT_NONCE: GaugeVec = register_gauge_vec!(
        "transactor_account_nonce",
        "Next nonce cached for the account",
        &["address"]
    ).unwrap();

    // Gas metrics
    pub static ref GAS_PRICE: GaugeVec = register_gauge_vec!(
        "transactor_gas_price_gwei",
        "Cached gas price in gwei",
        &["address"]
    ).unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> TransactorResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TransactorError::Metrics(format!("cannot encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| TransactorError::Metrics(format!("metrics are not utf-8: {}", e)))
}

// Helper functions to record metrics

pub fn record_tx_submitted() {
    TX_SUBMITTED.inc();
}

pub fn record_tx_confirmed(latency: Duration) {
    TX_CONFIRMED.inc();
    TX_LATENCY.observe(latency.as_secs_f64());
}

pub fn record_tx_failed(reason: &str) {
    TX_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_nonce_retry(fault: &str) {
    NONCE_RETRIES.with_label_values(&[fault]).inc();
}

pub fn record_nonce(address: &Address, nonce: u64) {
    ACCOUNT_NONCE
        .with_label_values(&[&format!("{:?}", address)])
        .set(nonce as f64);
}

pub fn record_gas_price(address: &Address, gas_price: U256) {
    let gwei = ethers::utils::format_units(gas_price, "gwei")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(f64::MAX);
    GAS_PRICE
        .with_label_values(&[&format!("{:?}", address)])
        .set(gwei);
}
