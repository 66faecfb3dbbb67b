//! brim - maker-rebate market-making bot
//!
//! Subcommands: `run` (trade with a config file), `paper` (defaults plus a
//! synthetic market), `recover` (load and report the durable snapshot),
//! `snapshot-now` (rewrite the snapshot from current store state).
//!
//! Exit codes: 0 clean, 1 error, 2 validation error.

use anyhow::{Context, Result};
use brim_bins::{init_logging, run_synthetic_market, shutdown_channel, CommonArgs};
use brim_core::config::Config;
use brim_core::core::errors::ConfigError;
use brim_core::core::types::Symbol;
use brim_core::engine::App;
use brim_core::exchange::{ExchangeApi, PaperExchange};
use brim_core::store::OrderStore;
use brim_core::utils::resolve_credentials;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "brim", author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Trade against the configured venue.
    Run,
    /// Paper-trade against the in-process venue with a synthetic market.
    Paper,
    /// Load the durable snapshot and report what would be recovered.
    Recover,
    /// Write a durable snapshot immediately and exit.
    SnapshotNow,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let redactor = match init_logging(&cli.common) {
        Ok(redactor) => redactor,
        Err(e) => {
            eprintln!("logging init failed: {e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "runtime construction failed");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Run => run(&cli.common, redactor, false).await,
            Command::Paper => run(&cli.common, redactor, true).await,
            Command::Recover => recover(&cli.common).await,
            Command::SnapshotNow => snapshot_now(&cli.common).await,
        }
    });

    match result {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            let code = if e.downcast_ref::<ConfigError>().is_some() { 2 } else { 1 };
            tracing::error!(error = ?e, "exiting with code {code}");
            ExitCode::from(code)
        }
    }
}

fn load_config(common: &CommonArgs, default_paper: bool) -> Result<Config> {
    match (&common.config, default_paper) {
        (Some(path), _) => Ok(Config::load(path)?),
        (None, true) => Ok(Config::for_symbols(vec!["BTCUSDT".to_string()])),
        (None, false) => Err(ConfigError::invalid("config", "run requires --config").into()),
    }
}

async fn run(common: &CommonArgs, redactor: brim_core::utils::Redactor, paper_mode: bool) -> Result<()> {
    let config = load_config(common, paper_mode)?;
    let symbols: Vec<Symbol> = config.symbols.iter().map(Symbol::new).collect();

    let credentials = resolve_credentials(&config.secrets, &redactor)?;
    if !paper_mode && credentials.is_none() {
        tracing::warn!("no credentials configured; the built-in venue is the paper exchange");
    }

    // The in-process paper venue is the only adapter compiled into this
    // binary; live venues implement brim_core::exchange::ExchangeApi.
    let paper = Arc::new(PaperExchange::new());
    let venue: Arc<dyn ExchangeApi> = paper.clone();

    let app = App::build(config, venue).await?;
    let recovered = app.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "resumed with recovered orders");
    }

    let (_tx, rx) = shutdown_channel()?;
    if paper_mode {
        tracing::info!("paper mode: synthetic market online");
        tokio::spawn(run_synthetic_market(paper, symbols, rx.clone()));
    }
    app.run(rx).await
}

async fn recover(common: &CommonArgs) -> Result<()> {
    let config = load_config(common, true)?;
    let store = OrderStore::new(config.store.clone());
    let recovered = store.recover().context("snapshot recovery")?;
    tracing::info!(
        open = recovered.len(),
        "recovery complete; non-terminal orders listed below"
    );
    for order in recovered {
        tracing::info!(
            cid = %order.client_order_id,
            symbol = %order.symbol,
            side = %order.side,
            state = %order.state,
            price = %order.price,
            qty = %order.qty,
            filled = %order.filled_qty,
            "recovered order"
        );
    }
    Ok(())
}

async fn snapshot_now(common: &CommonArgs) -> Result<()> {
    let config = load_config(common, true)?;
    let store = OrderStore::new(config.store.clone());
    // Load whatever exists so the rewrite preserves state, then write.
    let _ = store.recover().context("snapshot load")?;
    store.snapshot_blocking().context("snapshot write")?;
    tracing::info!("snapshot written");
    Ok(())
}
