//! Shared bootstrap for the brim binary
//!
//! CLI argument plumbing, logging initialization with the process redactor,
//! and the synthetic random-walk market that feeds paper mode.

use anyhow::Result;
use brim_core::core::types::{epoch_ms, Symbol};
use brim_core::exchange::PaperExchange;
use brim_core::marketdata::types::{BookSnapshot, DepthLevel};
use brim_core::utils::Redactor;
use clap::Args;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Arguments shared by every subcommand.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON log lines.
    #[arg(long)]
    pub json_logs: bool,
}

/// Initialize tracing; returns the redactor so credential resolution can
/// register secrets with it.
pub fn init_logging(args: &CommonArgs) -> Result<Redactor> {
    let redactor = Redactor::new();
    brim_core::utils::init_logging(&args.log_level, args.json_logs, redactor.clone())?;
    Ok(redactor)
}

/// Wire Ctrl-C to a shutdown watch channel.
pub fn shutdown_channel() -> Result<(watch::Sender<bool>, watch::Receiver<bool>)> {
    let (tx, rx) = watch::channel(false);
    let tx_clone = tx.clone();
    ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        let _ = tx_clone.send(true);
    })?;
    Ok((tx, rx))
}

/// Random-walk market generator for paper mode: publishes books and prints
/// trades against the paper venue until shutdown.
pub async fn run_synthetic_market(
    paper: Arc<PaperExchange>,
    symbols: Vec<Symbol>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut mids: Vec<f64> = symbols.iter().map(|_| 100.0).collect();
    let mut seq: u64 = 1;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        for (idx, symbol) in symbols.iter().enumerate() {
            let (step, trade_roll, trade_qty): (f64, f64, f64) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(-0.05..0.05),
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.05..0.5),
                )
            };
            let mid = (mids[idx] + step).max(1.0);
            mids[idx] = mid;

            let bid = Decimal::from_f64((mid - 0.01).max(0.01)).unwrap_or(dec!(99.99));
            let ask = Decimal::from_f64(mid + 0.01).unwrap_or(dec!(100.01));
            seq += 1;
            paper.set_book(BookSnapshot {
                symbol: symbol.clone(),
                bids: vec![
                    DepthLevel { price: bid.round_dp(2), qty: dec!(3.0) },
                    DepthLevel { price: (bid - dec!(0.01)).round_dp(2), qty: dec!(8.0) },
                ],
                asks: vec![
                    DepthLevel { price: ask.round_dp(2), qty: dec!(3.0) },
                    DepthLevel { price: (ask + dec!(0.01)).round_dp(2), qty: dec!(8.0) },
                ],
                seq,
                ts_recv: epoch_ms(),
                ts_cached: 0,
            });

            if trade_roll < 0.3 {
                let price = if trade_roll < 0.15 { bid } else { ask };
                paper.emit_trade(
                    symbol,
                    price.round_dp(2),
                    Decimal::from_f64(trade_qty).unwrap_or(dec!(0.1)).round_dp(3),
                );
            }
        }
    }
}
