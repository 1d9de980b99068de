//! Ledger Transactor - command-line front end for a single account
//!
//! Loads the account described by the configuration file and performs one
//! operation with it: a value transfer, a gas price lookup, a nonce resync or
//! a digest signature.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethers::types::{Address, H256, U256};
use ethers::utils::{format_units, parse_ether, parse_units};
use ledger_transactor::config::Settings;
use ledger_transactor::ledger::{LedgerClient, RpcLedger};
use ledger_transactor::tx::{GasOracle, GasStationOracle, NodeGasOracle, SpeedTier};
use ledger_transactor::{metrics, Account, Deadline};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, defaults to $TRANSACTOR_CONFIG or config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overall deadline for the operation
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    /// Print Prometheus metrics after the command finishes
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transfer ether to an address
    Transfer {
        #[arg(long)]
        to: Address,
        /// Amount in ether
        #[arg(long, required_unless_present = "all")]
        amount: Option<String>,
        /// Send the whole balance minus the fee
        #[arg(long)]
        all: bool,
        /// Gas price in gwei for this transfer only
        #[arg(long)]
        gas_price: Option<String>,
        #[arg(long, default_value_t = 0)]
        confirm_blocks: u64,
    },
    /// Print the oracle's recommended gas price
    GasPrice {
        #[arg(long)]
        tier: Option<SpeedTier>,
    },
    /// Reset the cached nonce to the ledger's pending nonce
    ResyncNonce {
        #[arg(long, default_value_t = 0)]
        cool_down_ms: u64,
    },
    /// Sign a 32-byte hex digest with the account key
    Sign {
        #[arg(long)]
        digest: H256,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    // Initialize logging
    init_logging(settings.logging.json);

    info!("Starting Ledger Transactor v{}", env!("CARGO_PKG_VERSION"));

    // Ctrl-C cancels whatever is in flight
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            warn!("Shutdown signal received, cancelling");
            shutdown.cancel();
        }
    });
    let deadline = Deadline::with_token(Duration::from_secs(args.timeout_secs), shutdown);

    match args.command {
        Command::Transfer {
            to,
            amount,
            all,
            gas_price,
            confirm_blocks,
        } => {
            let account = Account::from_settings(&settings).await?;
            let value = match amount {
                Some(amount) if !all => parse_ether(&amount).context("invalid amount")?,
                _ => U256::zero(),
            };
            let gas_price = gas_price
                .map(|gwei| parse_units(&gwei, "gwei").map(U256::from))
                .transpose()
                .context("invalid gas price")?;

            info!("Transferring from {:?} to {:?}", account.address(), to);
            let receipt = account
                .transfer(to, value, gas_price, confirm_blocks, all, &deadline)
                .await?;
            println!(
                "{:?} included in block {} (success: {})",
                receipt.tx_hash, receipt.block_number, receipt.success
            );
        }
        Command::GasPrice { tier } => {
            let tier = tier.unwrap_or(settings.gas_oracle.tier);
            let oracle: Arc<dyn GasOracle> = if settings.gas_oracle.url.is_empty() {
                let client: Arc<dyn LedgerClient> = Arc::new(RpcLedger::new(&settings.ledger)?);
                Arc::new(NodeGasOracle::new(client))
            } else {
                Arc::new(GasStationOracle::new(&settings.gas_oracle)?)
            };

            let price = deadline.run(oracle.price(tier)).await??;
            println!("{}: {} wei ({} gwei)", tier, price, format_units(price, "gwei")?);
        }
        Command::ResyncNonce { cool_down_ms } => {
            let account = Account::from_settings(&settings).await?;
            let before = account.nonce().await;
            let after = account
                .resync_nonce(Duration::from_millis(cool_down_ms), &deadline)
                .await?;
            println!("{:?}: nonce {} -> {}", account.address(), before, after);
        }
        Command::Sign { digest } => {
            let account = Account::from_settings(&settings).await?;
            let signature = account.sign(digest)?;
            println!("0x{}", hex::encode(signature.to_vec()));
        }
    }

    if args.print_metrics {
        print!("{}", metrics::render()?);
    }

    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ledger_transactor=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
